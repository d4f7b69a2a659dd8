//! Per-pool serialization of mutating rotation calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dutybot_id::PoolId;
use tokio::sync::OwnedMutexGuard;

use crate::error::{RotationError, RotationResult};

/// One async mutex per pool, created on first use.
#[derive(Debug, Default)]
pub struct PoolLocks {
    locks: Mutex<HashMap<PoolId, Arc<tokio::sync::Mutex<()>>>>,
}

impl PoolLocks {
    /// Wait up to `timeout` for exclusive access to `pool_id`.
    pub async fn acquire(
        &self,
        pool_id: PoolId,
        timeout: Duration,
    ) -> RotationResult<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(pool_id).or_default())
        };
        tokio::time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| RotationError::LockTimeout {
                pool_id,
                waited: timeout,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_held_lock_times_out() {
        let locks = PoolLocks::default();
        let pool_id = PoolId::new();
        let _held = locks
            .acquire(pool_id, Duration::from_millis(50))
            .await
            .unwrap();

        let err = locks
            .acquire(pool_id, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, RotationError::LockTimeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_pools_lock_independently() {
        let locks = PoolLocks::default();
        let _a = locks
            .acquire(PoolId::new(), Duration::from_millis(20))
            .await
            .unwrap();
        let b = locks.acquire(PoolId::new(), Duration::from_millis(20)).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_released_lock_can_be_reacquired() {
        let locks = PoolLocks::default();
        let pool_id = PoolId::new();
        drop(locks.acquire(pool_id, Duration::from_millis(20)).await.unwrap());
        assert!(locks
            .acquire(pool_id, Duration::from_millis(20))
            .await
            .is_ok());
    }
}
