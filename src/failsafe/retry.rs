//! Retry logic with exponential backoff

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::time::sleep;
use tracing::debug;

use crate::config::RetryConfig;
use crate::{Error, Result};

/// Status codes worth another attempt
const RETRYABLE_STATUS: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Lowercase message fragments that mark an error as transient
const RETRYABLE_KEYWORDS: [&str; 12] = [
    "timeout",
    "connection",
    "network",
    "rate limit",
    "too many requests",
    "service unavailable",
    "internal server error",
    "bad gateway",
    "gateway timeout",
    "temporary",
    "throttle",
    "quota exceeded",
];

/// Jitter amplitude as a fraction of the delay
const JITTER: f64 = 0.1;

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Whether retries are enabled
    pub enabled: bool,
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Perturb delays by up to ±10%
    pub jitter: bool,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }

    /// Attempts this policy allows
    fn attempt_budget(&self) -> u32 {
        if self.enabled { self.max_attempts } else { 1 }
    }

    /// Delay to sleep after failed attempt number `attempt` (1-based)
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let max_ms = self.max_delay.as_millis() as f64;
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let mut delay_ms =
            (self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent)).min(max_ms);

        if self.jitter && delay_ms > 0.0 {
            let offset = rand::rng().random_range(-JITTER..=JITTER) * delay_ms;
            delay_ms = (delay_ms + offset).clamp(0.0, max_ms);
        }

        Duration::from_millis(delay_ms.round() as u64)
    }

    /// Run `f` until it succeeds, fails permanently, or the attempt budget
    /// runs out. Returns the result along with the attempt history.
    pub async fn run<F, Fut, T>(&self, platform: &str, operation: &str, mut f: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let budget = self.attempt_budget();
        let mut attempts = Vec::new();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let error = match f().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(platform, operation, attempt, "Succeeded after retry");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(e) => e,
            };

            let delay = (attempt < budget && is_retryable(&error)).then(|| self.compute_delay(attempt));
            attempts.push(RetryAttempt {
                attempt,
                error: error.to_string(),
                status: error.status(),
                delay,
            });

            let Some(delay) = delay else {
                if attempt >= budget && budget > 1 {
                    debug!(platform, operation, attempts = attempt, "Max retry attempts reached");
                } else {
                    debug!(platform, operation, attempt, error = %error, "Not retrying");
                }
                return RetryOutcome {
                    result: Err(error),
                    attempts,
                };
            };

            debug!(
                platform,
                operation,
                attempt,
                delay_ms = delay.as_millis(),
                error = %error,
                "Retrying after backoff"
            );
            sleep(delay).await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

/// One failed attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryAttempt {
    /// 1-based attempt number
    pub attempt: u32,
    /// Error message of the attempt
    pub error: String,
    /// Status code of the error, if any
    pub status: Option<u16>,
    /// Backoff slept before the next attempt; `None` for the last one
    pub delay: Option<Duration>,
}

/// Result of a retried operation plus its failure history
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Final result; on failure, the last attempt's error
    pub result: Result<T>,
    /// Every failed attempt, in order
    pub attempts: Vec<RetryAttempt>,
}

impl<T> RetryOutcome<T> {
    /// Total attempts made
    pub fn attempt_count(&self) -> usize {
        self.attempts.len() + usize::from(self.result.is_ok())
    }
}

/// Execute a future with retry logic
///
/// # Errors
///
/// Returns the last error from `f` if all retry attempts are exhausted or
/// the error is not retryable.
pub async fn execute_with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    platform: &str,
    operation: &str,
    f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    policy.run(platform, operation, f).await.result
}

/// Check if an error is transient
pub fn is_retryable(error: &Error) -> bool {
    match error {
        // Local refusals: retrying inside the same call cannot help
        Error::CircuitOpen { .. }
        | Error::RateLimitTimeout { .. }
        | Error::RateLimited { .. }
        | Error::Config(_) => false,
        Error::Http(e) if e.is_timeout() || e.is_connect() => true,
        _ => {
            if error.status().is_some_and(|s| RETRYABLE_STATUS.contains(&s)) {
                return true;
            }
            let message = error.to_string().to_lowercase();
            RETRYABLE_KEYWORDS.iter().any(|k| message.contains(k))
        }
    }
}
