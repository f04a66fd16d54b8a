//! Bounded retry with a fixed delay.

use crate::models::{GenerationError, ProviderConfig};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// How many times a transient adapter failure is retried, and how long to
/// wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub delay: Duration,
}

/// Result of a retried operation plus how many attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, GenerationError>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(config.max_retries, Duration::from_millis(config.retry_delay_ms))
    }

    /// Never retry.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Run `op` until it succeeds, fails non-transiently, or the budget is
    /// spent. The last error is returned as terminal.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GenerationError>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(e) if e.is_transient() && attempts <= self.max_retries => {
                    let wait = self.wait_for(&e);
                    debug!(
                        job = label,
                        attempt = attempts,
                        kind = %e.kind,
                        wait_ms = wait.as_millis() as u64,
                        "Retrying after transient error"
                    );
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                }
                Err(e) => {
                    return RetryOutcome {
                        result: Err(e),
                        attempts,
                    };
                }
            }
        }
    }

    /// The fixed delay, stretched to a server's Retry-After hint.
    fn wait_for(&self, error: &GenerationError) -> Duration {
        error
            .retry_after_secs
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(Duration::from_secs_f64)
            .map_or(self.delay, |hint| hint.max(self.delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_secs(2))
    }
}
