//! Shared HTTP retry loop for provider clients.
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Failures surface as [`CoreError::Provider`] so callers can tell a
//! provider outage from a bug.

use anyhow::Result;
use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::warn;

use mimic_core::error::CoreError;

/// Delay before retry number `attempt` (1-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt.saturating_sub(1)).min(5))
}

pub fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Send the request produced by `build`, retrying transient failures up to
/// `max_retries` times. Returns the first successful response.
pub async fn send_with_retry<F>(provider: &str, max_retries: u32, mut build: F) -> Result<Response>
where
    F: FnMut() -> RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = backoff_delay(attempt);
            warn!(provider, attempt, delay_secs = delay.as_secs(), "retrying provider request");
            tokio::time::sleep(delay).await;
        }

        match build().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }

                let body_text = response.text().await.unwrap_or_default();
                let message = format!("API error {}: {}", status, body_text);
                if is_retryable(status) {
                    last_err = Some(message);
                    continue;
                }
                return Err(CoreError::provider(provider, message).into());
            }
            Err(e) => {
                last_err = Some(e.to_string());
                continue;
            }
        }
    }

    let message = last_err.unwrap_or_else(|| "request failed".to_string());
    Err(CoreError::provider(
        provider,
        format!("{} (after {} retries)", message, max_retries),
    )
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
        assert_eq!(backoff_delay(6), Duration::from_secs(32));
        assert_eq!(backoff_delay(20), Duration::from_secs(32));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable(StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_provider_error() {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let err = send_with_retry("test", 0, || client.get("http://127.0.0.1:9/unreachable"))
            .await
            .unwrap_err();
        assert!(mimic_core::error::is_provider_failure(&err));
    }
}
