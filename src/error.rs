use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing required environment variables: {}", .0.join(", "))]
    MissingEnv(Vec<String>),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Lakehouse error: {0}")]
    Lakehouse(String),

    #[error("SharePoint error: {0}")]
    SharePoint(String),

    #[error("Export error: {0}")]
    Export(String),

    #[error("Email error: {0}")]
    Email(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    /// Builds an [`AppError::Api`] from a non-success response, consuming its body.
    pub async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        AppError::Api { status, message }
    }

    /// Short category name used as the `error.type` span attribute.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Config(_) | AppError::MissingEnv(_) => "config_error",
            AppError::Auth(_) => "auth_error",
            AppError::Http(e) if e.is_timeout() => "timeout",
            AppError::Http(_) => "network_error",
            AppError::Api { status: 429, .. } => "rate_limit",
            AppError::Api { status, .. } if *status >= 500 => "server_error",
            AppError::Api { .. } => "invalid_request",
            AppError::Lakehouse(_) => "lakehouse_error",
            AppError::SharePoint(_) => "sharepoint_error",
            AppError::Export(_) => "export_error",
            AppError::Email(_) => "email_error",
            AppError::Io(_) => "io_error",
            AppError::Yaml(_) | AppError::Csv(_) | AppError::Json(_) => "serialization_error",
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
