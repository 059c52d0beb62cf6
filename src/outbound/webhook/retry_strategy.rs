use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::debug;

use super::schemas::{AttemptOutcome, AttemptRecord};

/// Upper bound of the random jitter, as a fraction of the base delay.
pub const JITTER_FACTOR: f64 = 0.2;

/// Retry configuration for webhook delivery.
///
/// The delay before retrying after attempt `n` is
/// `min(initial_delay * backoff_multiplier^(n-1), max_delay)`, plus up to 20%
/// jitter when enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,

    pub initial_delay: Duration,

    pub max_delay: Duration,

    pub backoff_multiplier: f64,

    pub jitter_enabled: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_enabled: true,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            ..Self::default()
        }
    }

    /// Set maximum delay cap
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter_enabled = enabled;
        self
    }

    /// Same curve, one attempt only.
    pub fn single_attempt(&self) -> Self {
        Self {
            max_attempts: 1,
            ..self.clone()
        }
    }

    /// Delay after attempt `attempt` (1-based) fails, before jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let initial_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        // Overflow goes to infinity and NaN is discarded by `min`, both land on the cap.
        let raw_ms = initial_ms * self.backoff_multiplier.powi(exponent);
        let capped_ms = raw_ms.min(max_ms).max(0.0);

        Duration::from_millis(capped_ms.floor() as u64)
    }

    /// Delay after attempt `attempt` fails, including jitter when enabled.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_delay(attempt);
        if !self.jitter_enabled {
            return base;
        }

        let fraction = rand::rng().random_range(0.0..=JITTER_FACTOR);
        let jitter_ms = (base.as_millis() as f64 * fraction).floor() as u64;
        base + Duration::from_millis(jitter_ms)
    }
}

/// Classification hook used by [`execute_with_retry`].
pub trait RetryableError: Display {
    fn is_retryable(&self) -> bool;

    fn status_code(&self) -> Option<u16> {
        None
    }

    fn is_timeout(&self) -> bool {
        false
    }
}

/// Status code carried by a successful attempt, if any.
pub trait AttemptResponse {
    fn status_code(&self) -> Option<u16> {
        None
    }
}

impl AttemptResponse for () {}

/// HTTP statuses worth another attempt: 5xx, 429 and 408.
pub fn is_retryable_status(status_code: u16) -> bool {
    matches!(status_code, 408 | 429 | 500..=599)
}

#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,

    /// Attempts actually made.
    pub attempts: u32,

    pub total_duration: Duration,
}

impl<T, E> RetryOutcome<T, E> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// `config.max_attempts` is reached. `on_attempt` sees every attempt as it
/// completes.
pub async fn execute_with_retry<T, E, F, Fut, A>(
    mut operation: F,
    config: &RetryConfig,
    mut on_attempt: A,
) -> RetryOutcome<T, E>
where
    T: AttemptResponse,
    E: RetryableError,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    A: FnMut(&AttemptRecord),
{
    let started = Instant::now();
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let timestamp = OffsetDateTime::now_utc();
        let attempt_started = Instant::now();
        let result = operation(attempt).await;
        let duration_ms = attempt_started.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                on_attempt(&AttemptRecord {
                    attempt_number: attempt,
                    timestamp,
                    outcome: AttemptOutcome::Success,
                    status_code: value.status_code(),
                    duration_ms,
                    error: None,
                });
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                    total_duration: started.elapsed(),
                };
            }
            Err(error) => {
                on_attempt(&AttemptRecord {
                    attempt_number: attempt,
                    timestamp,
                    outcome: if error.is_timeout() {
                        AttemptOutcome::Timeout
                    } else {
                        AttemptOutcome::Failed
                    },
                    status_code: error.status_code(),
                    duration_ms,
                    error: Some(error.to_string()),
                });

                if !error.is_retryable() {
                    debug!(attempt, error = %error, "Non-retryable error, giving up");
                    return RetryOutcome {
                        result: Err(error),
                        attempts: attempt,
                        total_duration: started.elapsed(),
                    };
                }

                if attempt >= max_attempts {
                    debug!(attempt, error = %error, "Retry attempts exhausted");
                    return RetryOutcome {
                        result: Err(error),
                        attempts: attempt,
                        total_duration: started.elapsed(),
                    };
                }

                let delay = config.retry_delay(attempt);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
