//! Bounded exponential backoff for object-storage calls.

use crate::utils::errors::StorageError;
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// How often and how patiently a storage call is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(5),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or exhausts `policy.max_attempts`.
///
/// Only [`StorageError::Transient`] failures are retried; the last error is
/// returned unchanged once attempts run out.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(policy.initial_interval)
        .with_max_interval(policy.max_interval)
        .with_randomization_factor(0.5)
        .with_multiplier(2.0)
        .with_max_elapsed_time(None)
        .build();

    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    backoff::future::retry_notify(
        backoff,
        || {
            attempt += 1;
            let current = attempt;
            let fut = op();
            async move {
                match fut.await {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_retryable() && current < max_attempts => {
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        },
        |err: StorageError, delay: Duration| {
            warn!(operation, error = %err, delay_ms = delay.as_millis() as u64, "Retrying storage call");
        },
    )
    .await
}
