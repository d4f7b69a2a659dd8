//! Bounded retry of units of work that hit storage conflicts.

use std::future::Future;
use std::time::Duration;

use dutybot_id::PoolId;
use tracing::warn;

use crate::error::{RotationError, RotationResult};

/// Default number of attempts per call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Delay before the first retry.
const BACKOFF_BASE: Duration = Duration::from_millis(50);

/// Maximum delay between attempts.
const BACKOFF_MAX: Duration = Duration::from_secs(1);

/// How often and how patiently to retry a conflicting unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: BACKOFF_BASE,
            max_delay: BACKOFF_MAX,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with anything but a storage
    /// conflict, or runs out of attempts.
    pub async fn run<T, F, Fut>(&self, pool_id: PoolId, mut op: F) -> RotationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RotationResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_store_conflict() => {
                    if attempt >= max_attempts {
                        return Err(RotationError::ConcurrencyConflict {
                            pool_id,
                            attempts: attempt,
                        });
                    }
                    let delay = self.delay_after(attempt);
                    warn!(
                        pool_id = %pool_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Storage conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
