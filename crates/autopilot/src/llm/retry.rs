//! Exponential backoff for opening provider requests.
//!
//! Only the request that opens a stream is retried. Once events start
//! flowing, a failure mid-stream is surfaced as [`LlmEvent::Error`]
//! (see [`super::LlmEvent`]) and the turn continues.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Configuration for retry behavior.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries (0 = fail on the first error).
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Scale delays by a fixed per-attempt factor to spread concurrent retries.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 500,
            max_delay_ms: 8_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay_ms as f64);
        let factor = if self.jitter {
            [0.75, 0.90, 0.60, 0.85][(attempt % 4) as usize]
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * factor / 1000.0)
    }
}

/// Whether an error string indicates a transient (retryable) failure.
pub fn is_transient_error(error: &str) -> bool {
    if ["429", "500", "502", "503", "504"]
        .iter()
        .any(|s| error.contains(&format!("HTTP {s}")))
    {
        return true;
    }
    let lower = error.to_lowercase();
    [
        "request failed:",
        "connection reset",
        "connection refused",
        "timed out",
        "broken pipe",
    ]
    .iter()
    .any(|p| lower.contains(p))
}

/// Whether an error is permanent and must not be retried.
pub fn is_permanent_error(error: &str) -> bool {
    ["HTTP 400", "HTTP 401", "HTTP 403", "HTTP 404", "HTTP 422"]
        .iter()
        .any(|p| error.contains(p))
}

/// Run `call` until it succeeds, fails permanently, or retries run out.
pub async fn retry_with_backoff<T, F, Fut>(config: &RetryConfig, mut call: F) -> Result<T, String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e)
                if attempt < config.max_retries
                    && is_transient_error(&e)
                    && !is_permanent_error(&e) =>
            {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    "Transient provider error (attempt {}/{}): {e}. Retrying in {delay:?}",
                    attempt + 1,
                    config.max_retries,
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_and_caps() {
        let config = RetryConfig {
            jitter: false,
            max_delay_ms: 2_000,
            ..RetryConfig::with_retries(10)
        };
        assert!(config.delay_for_attempt(1) > config.delay_for_attempt(0));
        assert!(config.delay_for_attempt(10) <= Duration::from_secs(2));
    }

    #[test]
    fn error_classification() {
        assert!(is_transient_error("OpenRouter API HTTP 429: rate limited"));
        assert!(is_transient_error("request failed: connection reset"));
        assert!(!is_transient_error("OpenRouter API HTTP 400: bad request"));
        assert!(is_permanent_error("OpenRouter API HTTP 401: unauthorized"));
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            initial_delay_ms: 1,
            ..RetryConfig::with_retries(3)
        };
        let result = retry_with_backoff(&config, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("HTTP 503: unavailable".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_with_backoff(&RetryConfig::with_retries(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("HTTP 401: unauthorized".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
