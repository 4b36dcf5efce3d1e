//! Lease locks on top of the fast store.
//!
//! A lock is a key holding the holder id, written with set-if-absent and a
//! lease TTL. Release deletes the key only while it still holds the same
//! holder id, so a holder whose lease expired cannot release a lock that
//! somebody else has since acquired.

use chrono::Utc;
use flashsale_core::{
    Acquired, FlashSaleError, FlashSaleResult, Lock, LockData, LockError, StoreResult,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::kv::KvStore;

/// Issues and releases lease locks.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KvStore>,
    process_id: Uuid,
    sequence: Arc<AtomicU64>,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("process_id", &self.process_id)
            .finish_non_exhaustive()
    }
}

impl DistributedLock {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            process_id: Uuid::new_v4(),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    fn next_holder_id(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.process_id, seq)
    }

    /// Try once to acquire `resource_key` for `lease`.
    ///
    /// Returns `None` when another holder has it. Never waits.
    pub async fn try_acquire(
        &self,
        resource_key: &str,
        lease: Duration,
    ) -> StoreResult<Option<Lock<Acquired>>> {
        let holder_id = self.next_holder_id();
        let acquired_at = Utc::now();
        if !self
            .store
            .set_if_absent(resource_key, &holder_id, Some(lease))
            .await?
        {
            debug!(resource = %resource_key, "lock held by another holder");
            return Ok(None);
        }

        let lease_expire_at = acquired_at
            + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero());
        Ok(Some(Lock::new(LockData {
            resource_key: resource_key.to_string(),
            holder_id,
            acquired_at,
            lease_expire_at,
        })))
    }

    /// Acquire or fail with `LockError::Unavailable`.
    pub async fn acquire(
        &self,
        resource_key: &str,
        lease: Duration,
    ) -> FlashSaleResult<Lock<Acquired>> {
        self.try_acquire(resource_key, lease)
            .await?
            .ok_or_else(|| {
                FlashSaleError::from(LockError::Unavailable {
                    resource: resource_key.to_string(),
                })
            })
    }

    /// Release a held lock.
    ///
    /// Returns `false` when the lease had already expired and the key no
    /// longer holds this holder id; the store is left untouched then.
    pub async fn release(&self, lock: Lock<Acquired>) -> StoreResult<bool> {
        let data = lock.release();
        let released = self
            .store
            .delete_if_equals(&data.resource_key, &data.holder_id)
            .await?;
        if !released {
            debug!(
                resource = %data.resource_key,
                holder = %data.holder_id,
                "lock lease lapsed before release"
            );
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn lock_over(store: &Arc<MemoryStore>) -> DistributedLock {
        DistributedLock::new(store.clone() as Arc<dyn KvStore>)
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let store = Arc::new(MemoryStore::new());
        let locks = lock_over(&store);

        let held = locks
            .try_acquire("lock:order:1", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert!(locks
            .try_acquire("lock:order:1", Duration::from_secs(10))
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            locks.acquire("lock:order:1", Duration::from_secs(10)).await,
            Err(FlashSaleError::Lock(LockError::Unavailable { .. }))
        ));

        assert!(locks.release(held).await.unwrap());
        assert!(locks
            .try_acquire("lock:order:1", Duration::from_secs(10))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_holder_ids_are_unique_per_acquisition() {
        let store = Arc::new(MemoryStore::new());
        let locks = lock_over(&store);
        let a = locks
            .try_acquire("lock:a", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        let b = locks
            .try_acquire("lock:b", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(a.holder_id(), b.holder_id());
        assert_eq!(
            store.get("lock:a").await.unwrap().as_deref(),
            Some(a.holder_id())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_release_does_not_free_new_holder() {
        let store = Arc::new(MemoryStore::new());
        let locks = lock_over(&store);

        let stale = locks
            .try_acquire("lock:order:1", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let fresh = locks
            .try_acquire("lock:order:1", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        assert!(!locks.release(stale).await.unwrap());
        assert_eq!(
            store.get("lock:order:1").await.unwrap().as_deref(),
            Some(fresh.holder_id())
        );
        assert!(locks.release(fresh).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let store = Arc::new(MemoryStore::new());
        let locks = lock_over(&store);
        store.set_offline(true);
        assert!(locks
            .try_acquire("lock:order:1", Duration::from_secs(1))
            .await
            .is_err());
    }
}
