// Bounded retry with exponential backoff for oracle and executor calls.
// Only transient failures are retried; everything else surfaces on the first attempt.

use crate::config::RetryConfig;
use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delays between attempts. One fewer than `max_attempts`.
    pub fn delays(&self) -> Vec<Duration> {
        let base = self.config.base_delay_ms.max(2);
        let retries = self.config.max_attempts.saturating_sub(1) as usize;
        let backoff = ExponentialBackoff::from_millis(2)
            .factor(base / 2)
            .max_delay(Duration::from_millis(self.config.max_delay_ms))
            .take(retries);

        if self.config.jitter {
            backoff.map(jitter).collect()
        } else {
            backoff.collect()
        }
    }

    /// Run `action` until it succeeds, the error is not retryable, or attempts run out
    pub async fn run<T, E, F, Fut, C>(&self, operation: &str, action: F, retryable: C) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let operation_id = uuid::Uuid::new_v4();
        debug!(
            operation = operation,
            %operation_id,
            max_attempts = self.config.max_attempts,
            "Starting retryable operation"
        );

        RetryIf::spawn(self.delays(), action, |error: &E| {
            let retry = retryable(error);
            if retry {
                warn!(operation = operation, %operation_id, error = %error, "Retryable failure");
            }
            retry
        })
        .await
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
