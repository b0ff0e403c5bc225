use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Renderings of the run's start time in the configured zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunClock {
    /// `%d-%m-%Y`, shown in the email.
    pub date: String,
    /// `%d-%m-%Y %H:%M:%S`, shown inside run logs.
    pub datetime: String,
    /// `%Y%m%d_%H%M%S`, safe to embed in SharePoint file names.
    pub stamp: String,
}

impl RunClock {
    pub fn now(tz: Tz) -> Self {
        Self::at(Utc::now(), tz)
    }

    pub fn at(instant: DateTime<Utc>, tz: Tz) -> Self {
        let local = tz.from_utc_datetime(&instant.naive_utc());
        Self {
            date: local.format("%d-%m-%Y").to_string(),
            datetime: local.format("%d-%m-%Y %H:%M:%S").to_string(),
            stamp: local.format("%Y%m%d_%H%M%S").to_string(),
        }
    }
}
