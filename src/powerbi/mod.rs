pub mod batch;

use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use opentelemetry::KeyValue;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::Instrument;

use crate::auth::TokenProvider;
use crate::config::ExportSettings;
use crate::error::{AppError, AppResult};
use crate::http::{RetryPolicy, send_with_retry};
use crate::telemetry::metrics::{PDF_EXPORT_DURATION, PDF_EXPORT_POLLS, PDF_EXPORTS_TOTAL};

pub use batch::{BatchOptions, BatchOutcome, generate_pdf_batch};

/// Renders one paginated report instance to PDF.
#[async_trait::async_trait]
pub trait PdfExporter: Send + Sync {
    async fn export(&self, parameter_name: &str, value: &str) -> AppResult<Bytes>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
    Other(String),
}

impl ExportStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "NotStarted" => Self::NotStarted,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::NotStarted | Self::Running)
    }
}

impl fmt::Display for ExportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => f.write_str("NotStarted"),
            Self::Running => f.write_str("Running"),
            Self::Succeeded => f.write_str("Succeeded"),
            Self::Failed => f.write_str("Failed"),
            Self::Other(raw) => f.write_str(raw),
        }
    }
}

#[derive(Deserialize)]
struct ExportJob {
    id: Option<String>,
}

#[derive(Deserialize)]
struct ExportState {
    status: Option<String>,
}

/// Power BI REST client for the asynchronous `ExportTo` API of one report.
pub struct PowerBiClient {
    http: reqwest::Client,
    tokens: TokenProvider,
    report_url: String,
    poll_interval: Duration,
    max_polls: u32,
}

impl PowerBiClient {
    pub fn new(
        http: reqwest::Client,
        tokens: TokenProvider,
        base_url: &str,
        workspace_id: &str,
        report_id: &str,
    ) -> Self {
        Self {
            http,
            tokens,
            report_url: format!(
                "{}/groups/{workspace_id}/reports/{report_id}",
                base_url.trim_end_matches('/')
            ),
            poll_interval: Duration::from_secs(10),
            max_polls: 30,
        }
    }

    pub fn with_polling(mut self, settings: &ExportSettings) -> Self {
        self.poll_interval = Duration::from_secs(settings.retry_interval_seconds);
        self.max_polls = settings.max_poll_attempts.max(1);
        self
    }

    #[cfg(test)]
    fn with_poll_interval(mut self, interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls;
        self
    }

    /// Acquires the Power BI token up front so credential problems surface
    /// before any export is attempted.
    pub async fn authenticate(&self) -> AppResult<()> {
        tracing::info!("Authenticating to Power BI using service principal");
        self.tokens.access_token().await?;
        tracing::info!("Successfully authenticated to Power BI");
        Ok(())
    }

    async fn start_export(&self, parameter_name: &str, value: &str) -> AppResult<String> {
        let token = self.tokens.access_token().await?;
        let body = json!({
            "format": "PDF",
            "paginatedReportConfiguration": {
                "parameterValues": [
                    {"name": parameter_name, "value": value}
                ]
            }
        });

        tracing::info!(parameter = parameter_name, value, "Initiating PDF export");
        let request = self
            .http
            .post(format!("{}/ExportTo", self.report_url))
            .bearer_auth(&token)
            .json(&body);
        let response = send_with_retry(request, &RetryPolicy::default()).await?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::ACCEPTED {
            let err = AppError::from_response(response).await;
            tracing::error!(error = %err, "Failed to initiate PDF export");
            return Err(err);
        }

        let job: ExportJob = response
            .json()
            .await
            .map_err(|e| AppError::Export(format!("malformed export response: {e}")))?;

        job.id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::Export("export response carried no id".into()))
    }

    async fn poll_status(&self, status_url: &str) -> AppResult<ExportStatus> {
        let token = self.tokens.access_token().await?;
        PDF_EXPORT_POLLS.add(1, &[]);

        let request = self.http.get(status_url).bearer_auth(&token);
        let response = send_with_retry(request, &RetryPolicy::default()).await?;

        let code = response.status();
        if code != StatusCode::OK && code != StatusCode::ACCEPTED {
            return Err(AppError::Export(format!(
                "failed to get export status: {}",
                code.as_u16()
            )));
        }

        let state: ExportState = response
            .json()
            .await
            .map_err(|e| AppError::Export(format!("malformed export status: {e}")))?;
        Ok(ExportStatus::parse(state.status.as_deref().unwrap_or("Running")))
    }

    async fn download(&self, status_url: &str) -> AppResult<Bytes> {
        let token = self.tokens.access_token().await?;
        let request = self
            .http
            .get(format!("{status_url}/file"))
            .bearer_auth(&token);
        let response = send_with_retry(request, &RetryPolicy::default()).await?;

        if response.status() != StatusCode::OK {
            return Err(AppError::Export(format!(
                "failed to download PDF: {}",
                response.status().as_u16()
            )));
        }

        let pdf = response.bytes().await?;
        tracing::info!(bytes = pdf.len(), "PDF downloaded to memory");
        Ok(pdf)
    }

    async fn run_export(&self, parameter_name: &str, value: &str) -> AppResult<Bytes> {
        let export_id = self.start_export(parameter_name, value).await?;
        let span = tracing::Span::current();
        span.record("powerbi.export_id", export_id.as_str());
        tracing::info!(export_id = %export_id, "Export initiated");

        let status_url = format!("{}/exports/{export_id}", self.report_url);

        for attempt in 1..=self.max_polls {
            let status = self.poll_status(&status_url).await?;
            span.record("powerbi.polls", attempt);

            match status {
                ExportStatus::Succeeded => {
                    tracing::info!(value, "Export completed");
                    return self.download(&status_url).await;
                }
                pending if pending.is_pending() => {
                    tracing::info!(
                        status = %pending,
                        attempt,
                        max_polls = self.max_polls,
                        "Export in progress"
                    );
                    if attempt < self.max_polls {
                        tokio::time::sleep(self.poll_interval).await;
                    }
                }
                other => {
                    return Err(AppError::Export(format!(
                        "export failed with status {other}"
                    )));
                }
            }
        }

        Err(AppError::Export(format!(
            "export did not complete after {} polls",
            self.max_polls
        )))
    }
}

#[async_trait::async_trait]
impl PdfExporter for PowerBiClient {
    async fn export(&self, parameter_name: &str, value: &str) -> AppResult<Bytes> {
        let span = tracing::info_span!(
            "powerbi.export",
            report.parameter = %parameter_name,
            report.value = %value,
            powerbi.export_id = tracing::field::Empty,
            powerbi.polls = tracing::field::Empty,
            otel.status_code = tracing::field::Empty,
            error.type = tracing::field::Empty,
        );
        let start = Instant::now();

        let result = self
            .run_export(parameter_name, value)
            .instrument(span.clone())
            .await;

        let duration = start.elapsed().as_secs_f64();
        let parameter_kv = KeyValue::new("report.parameter", parameter_name.to_string());

        match &result {
            Ok(_) => {
                PDF_EXPORTS_TOTAL.add(
                    1,
                    &[parameter_kv.clone(), KeyValue::new("outcome", "success")],
                );
                PDF_EXPORT_DURATION.record(duration, &[parameter_kv]);
            }
            Err(err) => {
                span.record("otel.status_code", "ERROR");
                span.record("error.type", err.kind());
                span.in_scope(|| {
                    tracing::error!(value, error = %err, "Failed to export report to PDF");
                });
                PDF_EXPORTS_TOTAL.add(1, &[parameter_kv, KeyValue::new("outcome", "failure")]);
            }
        }

        result
    }
}
