use crate::error::{Result, SentryError};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub enum RetryStrategy {
    /// Fixed delay between attempts; `max_attempts == 0` retries until success.
    Linear { max_attempts: u32, delay_ms: u64 },
    Exponential { max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64 },
}

/// Retry executor for handling recoverable operations
pub struct RetryExecutor {
    strategy: RetryStrategy,
}

impl RetryExecutor {
    pub fn new(strategy: RetryStrategy) -> Self {
        Self { strategy }
    }

    /// Execute an operation with retry logic
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        match &self.strategy {
            RetryStrategy::Linear { max_attempts, delay_ms } => {
                self.execute_linear(operation, *max_attempts, *delay_ms).await
            }
            RetryStrategy::Exponential { max_attempts, base_delay_ms, max_delay_ms } => {
                self.execute_exponential(operation, *max_attempts, *base_delay_ms, *max_delay_ms)
                    .await
            }
        }
    }

    async fn execute_linear<F, Fut, T>(
        &self,
        operation: F,
        max_attempts: u32,
        delay_ms: u64,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);
            debug!("Attempt {} of {}", attempt, bound_label(max_attempts));

            match operation().await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    let exhausted = max_attempts != 0 && attempt >= max_attempts;
                    if !err.is_recoverable() || exhausted {
                        return Err(err);
                    }

                    debug!("Attempt {} failed: {}, retrying in {}ms", attempt, err, delay_ms);
                    sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }

    async fn execute_exponential<F, Fut, T>(
        &self,
        operation: F,
        max_attempts: u32,
        base_delay_ms: u64,
        max_delay_ms: u64,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut delay = base_delay_ms;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            debug!("Attempt {} of {}", attempt, max_attempts);

            match operation().await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    if !err.is_recoverable() || attempt >= max_attempts {
                        return Err(err);
                    }

                    warn!("Attempt {} failed: {}, retrying in {}ms", attempt, err, delay);
                    sleep(Duration::from_millis(delay)).await;

                    // Exponential backoff with cap
                    delay = std::cmp::min(delay.saturating_mul(2), max_delay_ms);
                }
            }
        }
    }
}

fn bound_label(max_attempts: u32) -> String {
    if max_attempts == 0 {
        "unbounded".to_string()
    } else {
        max_attempts.to_string()
    }
}

/// Convenience functions for common retry patterns
pub async fn retry_with_exponential_backoff<F, Fut, T>(
    operation: F,
    max_attempts: u32,
    base_delay_ms: u64,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let executor = RetryExecutor::new(RetryStrategy::Exponential {
        max_attempts,
        base_delay_ms,
        max_delay_ms: base_delay_ms * 16, // Cap at 16x base delay
    });

    executor.execute(operation).await
}

/// Poll until `ready` reports true, sleeping a fixed delay between checks.
pub async fn wait_until_ready<F>(
    ready: F,
    label: &str,
    max_attempts: u32,
    delay_ms: u64,
) -> Result<()>
where
    F: Fn() -> bool,
{
    let executor = RetryExecutor::new(RetryStrategy::Linear { max_attempts, delay_ms });
    executor
        .execute(|| {
            let is_ready = ready();
            async move {
                if is_ready {
                    Ok(())
                } else {
                    crate::metrics::NOT_READY_RETRIES.inc();
                    Err(SentryError::NotReady(label.to_string()))
                }
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn linear_stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(RetryStrategy::Linear {
            max_attempts: 3,
            delay_ms: 5000,
        });
        let result: Result<()> = executor
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SentryError::NotReady("weapons".into())) }
            })
            .await;
        assert!(matches!(result, Err(SentryError::NotReady(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_recoverable_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_exponential_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SentryError::Config("bad".into())) }
            },
            5,
            10,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_ready_succeeds_once_flag_flips() {
        let checks = AtomicU32::new(0);
        let result = wait_until_ready(
            || checks.fetch_add(1, Ordering::SeqCst) >= 2,
            "cascade",
            0,
            5000,
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(checks.load(Ordering::SeqCst), 3);
    }
}
