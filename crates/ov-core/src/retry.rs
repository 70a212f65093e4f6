//! Exponential backoff for transient dependency failures.
//!
//! Schedule: base 500 ms doubling per attempt, capped at 30 s, at most
//! 5 attempts. Non-transient errors abort immediately.

use crate::error::{OvError, Result};
use std::future::Future;
use std::time::Duration;

pub const BACKOFF_BASE: Duration = Duration::from_millis(500);
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);
pub const MAX_ATTEMPTS: u32 = 5;

/// Delay before retry number `attempt` (1-based; attempt 1 is the
/// first retry).
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    let delay = BACKOFF_BASE.saturating_mul(1u32 << exp);
    delay.min(BACKOFF_CAP)
}

/// Run `op` with the standard schedule, retrying transient failures.
pub async fn with_backoff<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                attempt += 1;
                let delay = backoff_delay(attempt);
                tracing::debug!(attempt, ?delay, error = %e, "transient failure, backing off");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Wrap a future with a deadline, mapping expiry to [`OvError::Timeout`].
pub async fn with_timeout<T, Fut>(limit: Duration, what: &str, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(r) => r,
        Err(_) => Err(OvError::Timeout(format!("{what} exceeded {limit:?}"))),
    }
}
