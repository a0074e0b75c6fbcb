//! Automatic retry with exponential backoff and jitter for LLM calls.
//!
//! Retries transient HTTP/API errors (429, 500, 502, 503, 504, network timeouts)
//! with configurable exponential backoff. Never retries 400 (bad request) or 401
//! (auth) errors.
//!
//! This is transport-level retrying only. Re-generating code after a failed
//! execution is the orchestrator's job and is counted separately.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries (0 = no retries, just fail immediately).
    pub max_retries: u32,
    /// Initial delay before the first retry.
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Backoff multiplier (typically 2.0 for exponential backoff).
    pub multiplier: f64,
    /// Whether to add jitter to prevent thundering herd.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config with the given number of retries. Uses sensible defaults.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.jitter {
            // Deterministic jitter keyed on the attempt number.
            let jitter_factor = match attempt % 4 {
                0 => 0.75,
                1 => 0.90,
                2 => 0.60,
                _ => 0.85,
            };
            Duration::from_secs_f64(capped * jitter_factor)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Whether an error string indicates a transient (retryable) failure.
pub fn is_transient_error(error: &str) -> bool {
    let transient_statuses = ["429", "500", "502", "503", "504"];
    if transient_statuses
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
        "timeout",
        "broken pipe",
        "network",
    ]
    .iter()
    .any(|p| lower.contains(p))
}

/// Whether an error is a permanent (non-retryable) failure.
pub fn is_permanent_error(error: &str) -> bool {
    [
        "HTTP 400",
        "HTTP 401",
        "HTTP 403",
        "HTTP 404",
        "HTTP 422",
        "invalid",
        "bad request",
        "unauthorized",
    ]
    .iter()
    .any(|p| error.contains(p))
}

/// Retry an async API call with exponential backoff for transient errors.
pub async fn retry_api_call<T, F, Fut>(config: &RetryConfig, mut call: F) -> Result<T, String>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, String>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt < config.max_retries
                    && is_transient_error(&e)
                    && !is_permanent_error(&e)
                {
                    let delay = config.delay_for_attempt(attempt);
                    warn!(
                        "Transient API error (attempt {}/{}): {e}. Retrying in {delay:?}...",
                        attempt + 1,
                        config.max_retries,
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                } else {
                    return Err(e);
                }
            }
        }
    }
}
