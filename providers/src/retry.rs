//! HTTP retry policy with exponential backoff.
//!
//! - Max retries: 2 (3 total attempts)
//! - Initial delay: 500ms, doubling, capped at 8 seconds
//! - Jitter: down-jitter up to 25% (multiplier in [0.75, 1.0])
//! - Retryable: HTTP 408, 409, 429, 5xx and connection errors
//!
//! This only covers transport-level flakiness. Errors the server returns for
//! a well-formed request reach the conversation loop unchanged.

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries (not counting initial request).
    pub max_retries: u32,
    /// Initial backoff delay before first retry.
    pub initial_delay: Duration,
    /// Maximum backoff delay.
    pub max_delay: Duration,
    /// Jitter factor for down-jitter (0.25 = up to 25% reduction).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter_factor: 0.25,
        }
    }
}

/// Parse `Retry-After` or `Retry-After-Ms` headers.
///
/// Returns `Some(duration)` if a valid value is found and `0 < duration < 60s`.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(val) = headers.get("retry-after-ms")
        && let Ok(s) = val.to_str()
        && let Ok(ms) = s.parse::<f64>()
    {
        let duration = Duration::from_secs_f64(ms.max(0.0) / 1000.0);
        if duration > Duration::ZERO && duration < Duration::from_secs(60) {
            return Some(duration);
        }
    }

    if let Some(val) = headers.get("retry-after")
        && let Ok(s) = val.to_str()
        && let Ok(secs) = s.parse::<u64>()
    {
        let duration = Duration::from_secs(secs);
        if duration > Duration::ZERO && duration < Duration::from_secs(60) {
            return Some(duration);
        }
    }

    None
}

#[must_use]
pub fn should_retry(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 409 | 429 | 500..=599)
}

/// Backoff before retry number `backoff_step` (0-based).
#[must_use]
pub fn calculate_retry_delay(
    backoff_step: u32,
    config: &RetryConfig,
    headers: Option<&HeaderMap>,
) -> Duration {
    if let Some(headers) = headers
        && let Some(delay) = parse_retry_after(headers)
    {
        return delay;
    }

    let exponent = i32::try_from(backoff_step).unwrap_or(i32::MAX);
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(config.max_delay.as_secs_f64());

    let jitter = 1.0 - rand::random::<f64>() * config.jitter_factor;
    Duration::from_secs_f64(capped * jitter)
}

/// Outcome of a retried request.
#[derive(Debug)]
pub enum RetryOutcome {
    /// Request succeeded (2xx status).
    Success(Response),
    /// Final response was an HTTP error; the body is still unread.
    HttpError(Response),
    /// Transport failure on the last attempt.
    ConnectionError {
        attempts: u32,
        source: reqwest::Error,
    },
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout()
}

/// Send a request, retrying transient failures.
///
/// `build_request` is called once per attempt.
pub async fn send_with_retry<F>(build_request: F, config: &RetryConfig) -> RetryOutcome
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt = 0u32;
    loop {
        let last_attempt = attempt >= config.max_retries;
        match build_request().send().await {
            Ok(response) if response.status().is_success() => {
                return RetryOutcome::Success(response);
            }
            Ok(response) => {
                let status = response.status();
                if last_attempt || !should_retry(status) {
                    return RetryOutcome::HttpError(response);
                }
                let delay = calculate_retry_delay(attempt, config, Some(response.headers()));
                debug!(
                    %status,
                    retry = attempt + 1,
                    delay_ms = delay.as_millis(),
                    "Retrying request after error status"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if last_attempt || !is_retryable_error(&e) {
                    return RetryOutcome::ConnectionError {
                        attempts: attempt + 1,
                        source: e,
                    };
                }
                let delay = calculate_retry_delay(attempt, config, None);
                debug!(
                    error = %e,
                    retry = attempt + 1,
                    delay_ms = delay.as_millis(),
                    "Retrying request after connection error"
                );
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}
