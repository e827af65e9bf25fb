//! Delay policies: the fixed repeat/retry delay of streaming channels and the
//! exponential backoff used while connecting to the coordination service.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Fixed delay plus bounded random jitter, shared by repeat and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_after_ms: u64,
    pub jitter_ms: u64,
}

impl RetryPolicy {
    pub fn new(retry_after_ms: u64, jitter_ms: u64) -> Self {
        Self {
            retry_after_ms,
            jitter_ms,
        }
    }

    /// Delay before the next attempt, using the handler's base delay.
    pub fn delay(&self, retry_after_ms: u64) -> Duration {
        Duration::from_millis(retry_after_ms.saturating_add(jitter(self.jitter_ms)))
    }
}

fn jitter(bound_ms: u64) -> u64 {
    if bound_ms == 0 {
        return 0;
    }
    rand::random::<u64>() % (bound_ms + 1)
}

/// Exponential backoff settings for startup operations
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub use_jitter: bool,
}

impl BackoffConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay_ms: u64) -> Self {
        self.initial_delay_ms = delay_ms;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

/// Retry an async operation with exponential backoff.
pub async fn retry_with_backoff<F, Fut, T, E>(mut operation: F, config: BackoffConfig) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay_ms;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt, "Operation succeeded after retries");
                }
                return Ok(result);
            }
            Err(e) => {
                attempt += 1;
                if attempt > config.max_retries {
                    warn!(attempts = attempt, error = %e, "Operation failed, giving up");
                    return Err(e);
                }

                // 50% to 100% of the nominal delay
                let current = if config.use_jitter {
                    delay / 2 + jitter(delay / 2)
                } else {
                    delay
                };

                debug!(attempt, max = config.max_retries, error = %e, delay_ms = current, "Operation failed, retrying");
                tokio::time::sleep(Duration::from_millis(current)).await;

                delay = ((delay as f64 * config.backoff_multiplier) as u64).min(config.max_delay_ms);
            }
        }
    }
}
