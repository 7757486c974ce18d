//! Retry policy for provider calls.
//!
//! Transient failures (429/503 and connection-level errors) are retried with
//! exponential backoff. A server Retry-After hint is honored, capped at the
//! policy's max delay. Non-retryable errors propagate immediately.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::provider::ProviderError;

#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 8000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryOptions {
    /// Delay before the retry following `attempt` (0-based), honoring an
    /// optional server hint.
    fn delay_for(&self, attempt: u32, server_hint_ms: Option<u64>) -> Duration {
        let ms = match server_hint_ms {
            Some(hint) => hint.min(self.max_delay_ms),
            None => {
                let exp = (self.initial_delay_ms as f64)
                    * self.backoff_multiplier.powi(attempt as i32);
                (exp as u64).min(self.max_delay_ms)
            }
        };
        Duration::from_millis(ms)
    }
}

/// Transient classification: 429/503 responses and connection-level
/// failures (reset, refused, timed out).
pub fn is_retryable(err: &ProviderError) -> bool {
    match err {
        ProviderError::Api { status, .. } => matches!(status, 429 | 503),
        ProviderError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        _ => false,
    }
}

/// Run `op` with the retry policy. On exhaustion the last error is folded
/// into `RetriesExhausted` carrying the final status and body.
pub async fn with_retry<F, Fut, T>(opts: &RetryOptions, mut op: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut last_err: Option<ProviderError> = None;

    for attempt in 0..=opts.max_retries {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if !is_retryable(&e) {
                    return Err(e);
                }
                if attempt < opts.max_retries {
                    let hint = match &e {
                        ProviderError::Api { retry_after_ms, .. } => *retry_after_ms,
                        _ => None,
                    };
                    let delay = opts.delay_for(attempt, hint);
                    warn!(
                        attempt = attempt + 1,
                        max = opts.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient provider error, retrying"
                    );
                    sleep(delay).await;
                }
                last_err = Some(e);
            }
        }
    }

    Err(exhausted(last_err))
}

fn exhausted(last: Option<ProviderError>) -> ProviderError {
    match last {
        Some(ProviderError::Api { status, message, .. }) => ProviderError::RetriesExhausted {
            status,
            body: message,
        },
        Some(ProviderError::Http(e)) => ProviderError::RetriesExhausted {
            status: 0,
            body: e.to_string(),
        },
        Some(other) => other,
        None => ProviderError::RetriesExhausted {
            status: 0,
            body: "no attempts made".into(),
        },
    }
}

/// Parse a Retry-After header value: either delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str) -> Option<u64> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(secs * 1000);
    }
    let when = chrono::DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let delta_ms = when.timestamp_millis() - chrono::Utc::now().timestamp_millis();
    Some(delta_ms.max(0) as u64)
}
