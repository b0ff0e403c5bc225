use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;

use crate::config::{Secret, ServicePrincipal};
use crate::error::{AppError, AppResult};
use crate::http::{RetryPolicy, send_with_retry};

pub const POWERBI_SCOPE: &str = "https://analysis.windows.net/powerbi/api/.default";
pub const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
pub const SQL_SCOPE: &str = "https://database.windows.net/.default";

/// Tokens closer than this to expiry are refreshed before use.
const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct TokenError {
    error: Option<String>,
    error_description: Option<String>,
}

struct AccessToken {
    secret: String,
    expires_at: Instant,
}

impl AccessToken {
    fn is_fresh(&self) -> bool {
        self.expires_at > Instant::now() + REFRESH_MARGIN
    }
}

/// Azure AD client-credentials token source for a single scope.
pub struct TokenProvider {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: Secret,
    scope: String,
    cached: Mutex<Option<AccessToken>>,
}

impl TokenProvider {
    pub fn new(
        client: reqwest::Client,
        login_base: &str,
        principal: &ServicePrincipal,
        scope: &str,
    ) -> Self {
        Self {
            client,
            token_url: format!(
                "{}/{}/oauth2/v2.0/token",
                login_base.trim_end_matches('/'),
                principal.tenant_id
            ),
            client_id: principal.client_id.clone(),
            client_secret: principal.client_secret.clone(),
            scope: scope.to_string(),
            cached: Mutex::new(None),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Returns a bearer token, acquiring a new one when the cached token is
    /// missing or about to expire.
    pub async fn access_token(&self) -> AppResult<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && token.is_fresh()
        {
            return Ok(token.secret.clone());
        }

        let token = self.request_token().await?;
        let secret = token.secret.clone();
        *cached = Some(token);
        Ok(secret)
    }

    #[tracing::instrument(
        name = "auth.acquire_token",
        skip(self),
        fields(auth.scope = %self.scope)
    )]
    async fn request_token(&self) -> AppResult<AccessToken> {
        let request = self.client.post(&self.token_url).form(&[
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose()),
            ("scope", self.scope.as_str()),
            ("grant_type", "client_credentials"),
        ]);

        let response = send_with_retry(request, &RetryPolicy::default()).await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<TokenError>(&body)
                .ok()
                .and_then(|e| e.error_description.or(e.error))
                .unwrap_or(body);
            tracing::error!(status = status.as_u16(), error = %detail, "Failed to acquire token");
            return Err(AppError::Auth(format!(
                "failed to acquire token for {} ({status}): {detail}",
                self.scope
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| AppError::Auth(format!("malformed token response: {e}")))?;

        let expires_in = Duration::from_secs(body.expires_in.unwrap_or(3600));
        tracing::info!(
            expires_in_s = expires_in.as_secs(),
            "Successfully acquired access token"
        );

        Ok(AccessToken {
            secret: body.access_token,
            expires_at: Instant::now() + expires_in,
        })
    }
}
