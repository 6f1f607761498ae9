//! Bounded retries with exponential backoff for remote calls.

use jattach_storage::error::Result as StorageResult;
use std::future::Future;
use std::time::Duration;

/// How many times to try a remote call and how long to wait in between.
///
/// Only errors the storage layer marks as
/// [retryable](jattach_storage::error::ErrorKind::is_retryable) are retried;
/// everything else fails on the first attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the given retry (1 for the first retry).
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let millis = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    /// The last error is returned.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < attempts && error.is_retryable() => {
                    let delay = self.delay_for(attempt);
                    tracing::debug!(what, attempt, ?delay, error = %*error, "retrying remote call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(error) => return Err(error),
            }
        }
    }
}
