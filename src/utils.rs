use std::{fmt::Display, future::Future};

use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};

use crate::models::retry::RetryConfig;

/// Retries `operation` up to `max_attempts` times with jittered, capped
/// exponential backoff. Returns the last error once attempts run out.
pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;
    let mut delay_ms = config.initial_delay_ms;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    info!(
                        attempt,
                        max_attempts = config.max_attempts,
                        "Retry succeeded"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= config.max_attempts {
                    warn!(
                        max_attempts = config.max_attempts,
                        error = %e,
                        "Retry failed after exhausting all attempts"
                    );
                    return Err(e);
                }

                debug!(
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms,
                    "Retry attempt failed, backing off"
                );

                sleep(jittered(delay_ms, config)).await;
                delay_ms = delay_ms
                    .saturating_mul(config.backoff_multiplier)
                    .min(config.max_delay_ms);
            }
        }
    }
}

/// Like [`retry_with_backoff`] but never gives up; `max_attempts` is ignored.
///
/// Used where dropping the work is not an option, e.g. publishing a
/// dead-letter entry.
pub async fn retry_until_success<F, Fut, T, E>(config: &RetryConfig, what: &str, operation: F) -> T
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt: u32 = 0;
    let mut delay_ms = config.initial_delay_ms;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    info!(attempt, operation = what, "Retry succeeded");
                }
                return result;
            }
            Err(e) => {
                warn!(
                    attempt,
                    operation = what,
                    delay_ms,
                    error = %e,
                    "Operation failed, retrying"
                );

                sleep(jittered(delay_ms, config)).await;
                delay_ms = delay_ms
                    .saturating_mul(config.backoff_multiplier)
                    .min(config.max_delay_ms);
            }
        }
    }
}

fn jittered(delay_ms: u64, config: &RetryConfig) -> Duration {
    let ratio = config.jitter_ratio;
    let jitter = if ratio > 0.0 {
        rand::random_range(-ratio..=ratio)
    } else {
        0.0
    };

    Duration::from_millis((delay_ms as f64 * (1.0 + jitter)).max(0.0) as u64)
}
