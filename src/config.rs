use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use serde::Deserialize;

use crate::error::{AppError, AppResult};

/// Batch parameters loaded from the YAML settings file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub timezone: String,
    pub logging: LoggingSettings,
    pub queries: QuerySettings,
    pub powerbi: PowerBiSettings,
    pub processing: ProcessingSettings,
    pub sharepoint: SharePointSettings,
    pub link_generation: LinkGenerationSettings,
    pub email: EmailSettings,
    pub endpoints: Endpoints,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timezone: "Australia/Sydney".to_string(),
            logging: LoggingSettings::default(),
            queries: QuerySettings::default(),
            powerbi: PowerBiSettings::default(),
            processing: ProcessingSettings::default(),
            sharepoint: SharePointSettings::default(),
            link_generation: LinkGenerationSettings::default(),
            email: EmailSettings::default(),
            endpoints: Endpoints::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub file_path: PathBuf,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            file_path: PathBuf::from("fabric_pdf_generator.log"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    pub areas: Option<String>,
    pub employees: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PowerBiSettings {
    pub export: ExportSettings,
    pub parameters: ParameterSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    pub retry_interval_seconds: u64,
    pub max_poll_attempts: u32,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            retry_interval_seconds: 10,
            max_poll_attempts: 30,
        }
    }
}

/// Names of the paginated report parameters each category is exported with.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ParameterSettings {
    pub areas: String,
    pub employees: String,
}

impl Default for ParameterSettings {
    fn default() -> Self {
        Self {
            areas: "Area".to_string(),
            employees: "Employee".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingSettings {
    pub batch_size_areas: usize,
    pub batch_size_employees: usize,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub upload_batch_size: usize,
    pub link_generation_batch_size: usize,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            batch_size_areas: 20,
            batch_size_employees: 20,
            max_retries: 3,
            retry_delay_seconds: 5,
            upload_batch_size: 50,
            link_generation_batch_size: 50,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SharePointSettings {
    pub folders: FolderSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FolderSettings {
    pub areas: String,
    pub employees: String,
    pub logs: String,
}

impl Default for FolderSettings {
    fn default() -> Self {
        Self {
            areas: "Areas".to_string(),
            employees: "Employees".to_string(),
            logs: "Logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkGenerationSettings {
    pub csv_filename: String,
    pub log_filename_template: String,
}

impl Default for LinkGenerationSettings {
    fn default() -> Self {
        Self {
            csv_filename: "Shareable_Links_Employees.csv".to_string(),
            log_filename_template: "Logs_LinkGeneration_{timestamp}.txt".to_string(),
        }
    }
}

impl LinkGenerationSettings {
    pub fn log_filename(&self, timestamp: &str) -> String {
        self.log_filename_template.replace("{timestamp}", timestamp)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmailSettings {
    pub report_title: String,
    pub employee_label: String,
    pub cc: Vec<String>,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            report_title: "BCP PDF Generation Report".to_string(),
            employee_label: "Specialised Carers".to_string(),
            cc: Vec::new(),
        }
    }
}

/// Base URLs of the remote services, overridable for sovereign clouds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub login: String,
    pub graph: String,
    pub powerbi: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            login: "https://login.microsoftonline.com".to_string(),
            graph: "https://graph.microsoft.com/v1.0".to_string(),
            powerbi: "https://api.powerbi.com/v1.0/myorg".to_string(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("cannot read settings file {}: {e}", path.display()))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> AppResult<Self> {
        let settings: Settings = serde_yaml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> AppResult<()> {
        self.tz()?;

        let processing = &self.processing;
        for (name, value) in [
            ("processing.batch_size_areas", processing.batch_size_areas),
            ("processing.batch_size_employees", processing.batch_size_employees),
            ("processing.upload_batch_size", processing.upload_batch_size),
            (
                "processing.link_generation_batch_size",
                processing.link_generation_batch_size,
            ),
        ] {
            if value == 0 {
                return Err(AppError::Config(format!("{name} must be at least 1")));
            }
        }

        if self.powerbi.export.max_poll_attempts == 0 {
            return Err(AppError::Config(
                "powerbi.export.max_poll_attempts must be at least 1".into(),
            ));
        }

        if !self
            .link_generation
            .log_filename_template
            .contains("{timestamp}")
        {
            return Err(AppError::Config(
                "link_generation.log_filename_template must contain {timestamp}".into(),
            ));
        }

        Ok(())
    }

    pub fn tz(&self) -> AppResult<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| AppError::Config(format!("unknown timezone {:?}: {e}", self.timezone)))
    }

    pub fn area_query(&self) -> AppResult<&str> {
        self.queries
            .areas
            .as_deref()
            .ok_or_else(|| AppError::Config("queries.areas is not set".into()))
    }

    pub fn employee_query(&self) -> AppResult<&str> {
        self.queries
            .employees
            .as_deref()
            .ok_or_else(|| AppError::Config("queries.employees is not set".into()))
    }
}

/// A string that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

#[derive(Debug, Clone)]
pub struct ServicePrincipal {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: Secret,
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub server: String,
    pub port: u16,
    pub password: Secret,
}

/// Tenant identifiers and secrets read from the process environment.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub fabric: ServicePrincipal,
    pub sql_endpoint: String,
    pub database: String,
    pub powerbi_workspace_id: String,
    pub powerbi_report_id: String,
    pub sharepoint: ServicePrincipal,
    pub site_url: String,
    pub site_path: String,
    pub drive_name: String,
    pub email_sender: String,
    pub email_recipients: Vec<String>,
    pub smtp: Option<SmtpSettings>,
}

const REQUIRED_VARS: [&str; 15] = [
    "FABRIC_TENANT_ID",
    "FABRIC_CLIENT_ID",
    "FABRIC_CLIENT_SECRET",
    "FABRIC_SQL_ENDPOINT",
    "FABRIC_DATABASE_NAME",
    "POWERBI_WORKSPACE_ID",
    "POWERBI_REPORT_ID",
    "SHAREPOINT_TENANT_ID",
    "SHAREPOINT_CLIENT_ID",
    "SHAREPOINT_CLIENT_SECRET",
    "SHAREPOINT_SITE_URL",
    "SHAREPOINT_SITE_PATH",
    "SHAREPOINT_DRIVE_NAME",
    "EMAIL_SENDER",
    "EMAIL_RECIPIENT",
];

impl Credentials {
    pub fn from_env() -> AppResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads every variable through `lookup`; empty values count as missing.
    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let missing: Vec<String> = REQUIRED_VARS
            .iter()
            .copied()
            .filter(|name| get(*name).is_none())
            .map(String::from)
            .collect();
        if !missing.is_empty() {
            return Err(AppError::MissingEnv(missing));
        }

        let req = |name: &str| get(name).unwrap_or_default();

        let email_recipients: Vec<String> = req("EMAIL_RECIPIENT")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if email_recipients.is_empty() {
            return Err(AppError::Config(
                "EMAIL_RECIPIENT does not contain any address".into(),
            ));
        }

        let smtp = match (get("SMTP_SERVER"), get("SMTP_PORT"), get("SMTP_PASSWORD")) {
            (Some(server), Some(port), Some(password)) => match port.trim().parse::<u16>() {
                Ok(port) => Some(SmtpSettings {
                    server,
                    port,
                    password: Secret::new(password),
                }),
                Err(_) => {
                    tracing::error!(smtp_port = %port, "Invalid SMTP port, SMTP fallback disabled");
                    None
                }
            },
            _ => None,
        };

        let credentials = Self {
            fabric: ServicePrincipal {
                tenant_id: req("FABRIC_TENANT_ID"),
                client_id: req("FABRIC_CLIENT_ID"),
                client_secret: Secret::new(req("FABRIC_CLIENT_SECRET")),
            },
            sql_endpoint: req("FABRIC_SQL_ENDPOINT"),
            database: req("FABRIC_DATABASE_NAME"),
            powerbi_workspace_id: req("POWERBI_WORKSPACE_ID"),
            powerbi_report_id: req("POWERBI_REPORT_ID"),
            sharepoint: ServicePrincipal {
                tenant_id: req("SHAREPOINT_TENANT_ID"),
                client_id: req("SHAREPOINT_CLIENT_ID"),
                client_secret: Secret::new(req("SHAREPOINT_CLIENT_SECRET")),
            },
            site_url: req("SHAREPOINT_SITE_URL"),
            site_path: req("SHAREPOINT_SITE_PATH"),
            drive_name: req("SHAREPOINT_DRIVE_NAME"),
            email_sender: req("EMAIL_SENDER"),
            email_recipients,
            smtp,
        };

        tracing::info!("Successfully retrieved environment variables");
        Ok(credentials)
    }
}

/// Settings for the telemetry pipeline, read before anything else so that
/// failures further on are logged.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub environment: String,
    pub otel_service_name: String,
    pub otel_exporter_endpoint: Option<String>,
    pub log_file: PathBuf,
}

impl TelemetryConfig {
    pub fn from_env(log_file: PathBuf) -> Self {
        dotenvy::dotenv().ok();

        Self {
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            otel_service_name: env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| "report-publisher".to_string()),
            otel_exporter_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|v| !v.is_empty()),
            log_file,
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
