use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::CoreError;
use crate::store::StoreResult;

/// Runs `op` until it succeeds, returns an error `is_retriable` rejects, or
/// `config.max_attempts` is exhausted. The last error is returned.
pub async fn with_retry<T, E, F, Fut, P>(config: &RetryConfig, is_retriable: P, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt: u16 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts || !is_retriable(&err) {
                    return Err(err);
                }
                let delay = jittered_delay(config, attempt - 1);
                tracing::debug!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn jittered_delay(config: &RetryConfig, retry: u16) -> Duration {
    let anchor = config.anchor_delay_ms(retry);
    if anchor == 0 {
        return Duration::ZERO;
    }
    let span = (anchor as f64) * f64::from(config.jitter_ratio.clamp(0.0, 1.0));
    let lower = (anchor as f64 - span).max(0.0);
    let upper = (anchor as f64 + span).min(config.backoff_max_ms as f64).max(lower);
    let ms = if upper > lower {
        rand::rng().random_range(lower..=upper)
    } else {
        lower
    };
    Duration::from_millis(ms.round() as u64)
}

/// Retriability of object writes: conflicts, transient store outages and
/// "not found yet" races are retried.
pub fn store_write_retriable(err: &crate::error::StoreError) -> bool {
    CoreError::Store(err.clone()).is_retriable()
}

/// Convenience wrapper for store writes.
pub async fn retry_store<T, F, Fut>(config: &RetryConfig, op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    with_retry(config, store_write_retriable, op).await
}
