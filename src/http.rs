use std::time::Duration;

use opentelemetry::KeyValue;
use reqwest::header::{HeaderValue, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};

use crate::error::{AppError, AppResult};
use crate::telemetry::metrics::HTTP_RETRY_COUNT;

const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Link generation against a throttling Graph API: 1s, 2s.
    pub fn throttled() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(8),
        }
    }

    /// Small text uploads (CSV, run logs): 1s, 2s, 4s, 8s.
    pub fn uploads() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(16),
        }
    }

    /// A single attempt, used where the caller does its own retrying.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Exponential backoff for the given 1-based attempt, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    fn delay(&self, attempt: u32, retry_after: Option<&HeaderValue>) -> Duration {
        if let Some(delay) = parse_retry_after(retry_after) {
            return delay;
        }
        let base = self.backoff(attempt);
        // up to 25% jitter
        let jitter_ms = fastrand::u64(0..=base.as_millis() as u64 / 4);
        base + Duration::from_millis(jitter_ms)
    }
}

pub fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn parse_retry_after(value: Option<&HeaderValue>) -> Option<Duration> {
    let secs = value?.to_str().ok()?.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}

/// Sends `request`, retrying throttling, server errors and transient
/// transport failures. The last response is returned whatever its status.
pub async fn send_with_retry(request: RequestBuilder, policy: &RetryPolicy) -> AppResult<Response> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let Some(cloned) = request.try_clone() else {
            return request.send().await.map_err(AppError::Http);
        };
        let last = attempt >= attempts;

        match cloned.send().await {
            Ok(response) => {
                let status = response.status();
                if last || !is_retryable(status) {
                    return Ok(response);
                }
                let delay = policy.delay(attempt, response.headers().get(RETRY_AFTER));
                tracing::warn!(
                    attempt,
                    max_attempts = attempts,
                    status = status.as_u16(),
                    url = %response.url(),
                    delay_ms = delay.as_millis() as u64,
                    "Request failed with retryable status, retrying"
                );
                HTTP_RETRY_COUNT.add(
                    1,
                    &[KeyValue::new("http.status_code", status.as_u16().to_string())],
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                let transient = err.is_timeout() || err.is_connect();
                if last || !transient {
                    return Err(AppError::Http(err));
                }
                let delay = policy.delay(attempt, None);
                tracing::warn!(
                    attempt,
                    max_attempts = attempts,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Request failed with transport error, retrying"
                );
                HTTP_RETRY_COUNT.add(1, &[KeyValue::new("http.status_code", "transport")]);
                tokio::time::sleep(delay).await;
            }
        }

        attempt += 1;
    }
}
