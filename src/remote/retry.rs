//! Bounded exponential backoff

use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Attempts before giving up
pub const MAX_ATTEMPTS: u32 = 5;

const BASE_DELAY: Duration = Duration::from_millis(100);
const MAX_DELAY: Duration = Duration::from_secs(2);

/// Delay before retry number `attempt` (1-based)
pub fn backoff_delay(attempt: u32) -> Duration {
    BASE_DELAY
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(MAX_DELAY)
}

/// Run `op` until it succeeds, fails with a non-transient error, or
/// [`MAX_ATTEMPTS`] is reached
pub async fn with_backoff<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                let delay = backoff_delay(attempt);
                warn!(what, attempt, error = %e, ?delay, "transient failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Poll `read` until it returns `expected`, with the same backoff schedule
///
/// Returns the last value read; callers compare it to decide what to do.
pub async fn wait_for<F, Fut>(expected: &str, mut read: F) -> Result<String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let mut attempt = 1;
    loop {
        let value = read().await?;
        if value == expected || attempt >= MAX_ATTEMPTS {
            return Ok(value);
        }
        tokio::time::sleep(backoff_delay(attempt)).await;
        attempt += 1;
    }
}
