//! Read-through cache client over the fast store.
//!
//! Three read strategies, all keyed by `prefix + id`:
//!
//! - [`CacheClient::query_with_pass_through`]: load on miss and cache the
//!   result; a missing entity is remembered with an empty-string sentinel for
//!   the null TTL so repeated lookups of unknown ids never reach the loader.
//! - [`CacheClient::query_with_logical_expire`]: entries never expire in the
//!   store. A read past the in-band deadline returns the stale payload at once
//!   and, if it wins the per-key rebuild lock, hands a reload to the
//!   [`RebuildPool`]. At most one rebuild per key is in flight.
//! - [`CacheClient::query_with_mutex`]: passthrough, except that on a miss
//!   only the holder of the per-key lock loads while others wait and re-read.
//!
//! An entry that fails to deserialize is logged and treated as a miss.

use chrono::Utc;
use flashsale_core::constants::LOCK_CACHE_KEY;
use flashsale_core::{CacheConfig, CacheError, FlashSaleResult, Lock, LockError};
use futures_util::FutureExt;
use serde::Serialize;
use std::fmt::Display;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::envelope::{CacheRead, LogicalEnvelope};
use super::rebuild::{RebuildHandle, RebuildOutcome, RebuildPool};
use super::traits::{CacheStats, Cacheable, EntityLoader};
use crate::kv::KvStore;
use crate::lock::DistributedLock;

/// Value written for ids the loader could not find.
pub const NULL_SENTINEL: &str = "";

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    null_hits: AtomicU64,
    misses: AtomicU64,
    stale_hits: AtomicU64,
    loads: AtomicU64,
    corrupt_entries: AtomicU64,
    rebuilds_scheduled: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

enum Lookup<T> {
    Hit(T),
    Null,
    Miss,
}

pub struct CacheClient {
    store: Arc<dyn KvStore>,
    locks: DistributedLock,
    pool: Arc<RebuildPool>,
    config: CacheConfig,
    counters: Arc<CacheCounters>,
}

impl std::fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl CacheClient {
    pub fn new(
        store: Arc<dyn KvStore>,
        locks: DistributedLock,
        pool: Arc<RebuildPool>,
        config: CacheConfig,
    ) -> Self {
        Self {
            store,
            locks,
            pool,
            config,
            counters: Arc::new(CacheCounters::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<RebuildPool> {
        &self.pool
    }

    pub fn cache_key(prefix: &str, id: &impl Display) -> String {
        format!("{}{}", prefix, id)
    }

    fn lock_key(cache_key: &str) -> String {
        format!("{}{}", LOCK_CACHE_KEY, cache_key)
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            null_hits: c.null_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            stale_hits: c.stale_hits.load(Ordering::Relaxed),
            loads: c.loads.load(Ordering::Relaxed),
            corrupt_entries: c.corrupt_entries.load(Ordering::Relaxed),
            rebuilds_scheduled: c.rebuilds_scheduled.load(Ordering::Relaxed),
        }
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Write `value` as JSON with a store TTL.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> FlashSaleResult<()> {
        let raw = serde_json::to_string(value).map_err(|e| CacheError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.store.set(key, &raw, Some(ttl)).await?;
        Ok(())
    }

    /// Write `value` wrapped in a logical-expiration envelope, with no store
    /// TTL. Used to pre-warm hot keys.
    pub async fn set_with_logical_expire<T: Serialize>(
        &self,
        key: &str,
        value: T,
        ttl: Duration,
    ) -> FlashSaleResult<()> {
        let envelope = LogicalEnvelope::wrap(value, ttl, Utc::now());
        let raw = serde_json::to_string(&envelope).map_err(|e| CacheError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.store.set(key, &raw, None).await?;
        Ok(())
    }

    /// Drop the cached entry for `prefix + id`. Call after a durable update.
    pub async fn invalidate(&self, prefix: &str, id: impl Display) -> FlashSaleResult<bool> {
        let key = Self::cache_key(prefix, &id);
        let removed = self.store.delete(&key).await?;
        debug!(key = %key, removed, "cache entry invalidated");
        Ok(removed)
    }

    // ========================================================================
    // READS
    // ========================================================================

    async fn lookup<T: Cacheable>(&self, key: &str) -> FlashSaleResult<Lookup<T>> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(Lookup::Miss);
        };
        if raw == NULL_SENTINEL {
            return Ok(Lookup::Null);
        }
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Lookup::Hit(value)),
            Err(e) => {
                bump(&self.counters.corrupt_entries);
                warn!(key = %key, error = %e, "corrupt cache entry, treating as miss");
                Ok(Lookup::Miss)
            }
        }
    }

    async fn load_and_fill<K, T, L>(
        &self,
        key: &str,
        id: &K,
        loader: &L,
        ttl: Duration,
    ) -> FlashSaleResult<Option<T>>
    where
        K: Sync,
        T: Cacheable,
        L: EntityLoader<K, T> + ?Sized,
    {
        bump(&self.counters.loads);
        match loader.load(id).await? {
            None => {
                if let Err(e) = self
                    .store
                    .set(key, NULL_SENTINEL, Some(self.config.null_ttl))
                    .await
                {
                    warn!(key = %key, error = %e, "failed to write null sentinel");
                }
                Ok(None)
            }
            Some(value) => {
                if let Err(e) = self.set(key, &value, ttl).await {
                    warn!(key = %key, error = %e, "failed to write loaded value to cache");
                }
                Ok(Some(value))
            }
        }
    }

    /// Passthrough read with negative caching.
    pub async fn query_with_pass_through<K, T, L>(
        &self,
        prefix: &str,
        id: K,
        loader: &L,
        ttl: Duration,
    ) -> FlashSaleResult<Option<T>>
    where
        K: Display + Send + Sync,
        T: Cacheable,
        L: EntityLoader<K, T> + ?Sized,
    {
        let key = Self::cache_key(prefix, &id);
        match self.lookup(&key).await? {
            Lookup::Hit(value) => {
                bump(&self.counters.hits);
                Ok(Some(value))
            }
            Lookup::Null => {
                bump(&self.counters.null_hits);
                Ok(None)
            }
            Lookup::Miss => {
                bump(&self.counters.misses);
                self.load_and_fill(&key, &id, loader, ttl).await
            }
        }
    }

    /// Logical-expiration read.
    ///
    /// A miss returns `None` without loading: keys served this way are
    /// expected to be pre-warmed with [`set_with_logical_expire`].
    ///
    /// [`set_with_logical_expire`]: CacheClient::set_with_logical_expire
    pub async fn query_with_logical_expire<K, T, L>(
        &self,
        prefix: &str,
        id: K,
        loader: Arc<L>,
        ttl: Duration,
    ) -> FlashSaleResult<Option<CacheRead<T>>>
    where
        K: Display + Send + Sync + 'static,
        T: Cacheable,
        L: EntityLoader<K, T> + ?Sized + 'static,
    {
        let key = Self::cache_key(prefix, &id);
        let raw = match self.store.get(&key).await? {
            Some(raw) if raw != NULL_SENTINEL => raw,
            _ => {
                bump(&self.counters.misses);
                return Ok(None);
            }
        };
        let envelope: LogicalEnvelope<T> = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                bump(&self.counters.corrupt_entries);
                bump(&self.counters.misses);
                warn!(key = %key, error = %e, "corrupt cache entry, treating as miss");
                return Ok(None);
            }
        };

        if !envelope.is_expired(Utc::now()) {
            bump(&self.counters.hits);
            return Ok(Some(CacheRead::fresh(envelope.data, envelope.expire_time)));
        }

        bump(&self.counters.stale_hits);
        let rebuild = self.schedule_rebuild(key, id, loader, ttl).await;
        Ok(Some(CacheRead::stale(
            envelope.data,
            envelope.expire_time,
            rebuild,
        )))
    }

    async fn schedule_rebuild<K, T, L>(
        &self,
        key: String,
        id: K,
        loader: Arc<L>,
        ttl: Duration,
    ) -> Option<RebuildHandle>
    where
        K: Send + Sync + 'static,
        T: Cacheable,
        L: EntityLoader<K, T> + ?Sized + 'static,
    {
        let lock_key = Self::lock_key(&key);
        let lock = match self
            .locks
            .try_acquire(&lock_key, self.config.rebuild_lock_lease)
            .await
        {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                debug!(key = %key, "rebuild already in flight");
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "could not take rebuild lock");
                return None;
            }
        };
        let lock_data = lock.data().clone();

        let store = Arc::clone(&self.store);
        let locks = self.locks.clone();
        let counters = Arc::clone(&self.counters);
        let job_key = key.clone();
        let job = async move {
            let rebuild = rebuild_entry::<K, T, L>(
                store.as_ref(),
                &counters,
                &job_key,
                &id,
                loader.as_ref(),
                ttl,
            );
            // The lock goes back even when the loader panics.
            let outcome = AssertUnwindSafe(rebuild)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| RebuildOutcome::Failed("loader panicked".to_string()));
            if let Err(e) = locks.release(lock).await {
                warn!(key = %job_key, error = %e, "failed to release rebuild lock");
            }
            outcome
        };

        match self.pool.submit(key.clone(), job) {
            Ok(handle) => {
                bump(&self.counters.rebuilds_scheduled);
                debug!(key = %key, "cache rebuild scheduled");
                Some(handle)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "rebuild pool rejected job");
                if let Err(e) = self.locks.release(Lock::new(lock_data)).await {
                    warn!(key = %key, error = %e, "failed to release rebuild lock");
                }
                None
            }
        }
    }

    /// Passthrough read where only the lock holder loads on a miss.
    ///
    /// Waiters sleep `mutex_retry_delay` between attempts and give up with
    /// `LockError::Unavailable` after `mutex_max_retries`.
    pub async fn query_with_mutex<K, T, L>(
        &self,
        prefix: &str,
        id: K,
        loader: &L,
        ttl: Duration,
    ) -> FlashSaleResult<Option<T>>
    where
        K: Display + Send + Sync,
        T: Cacheable,
        L: EntityLoader<K, T> + ?Sized,
    {
        let key = Self::cache_key(prefix, &id);
        let lock_key = Self::lock_key(&key);

        for attempt in 0..=self.config.mutex_max_retries {
            match self.lookup(&key).await? {
                Lookup::Hit(value) => {
                    bump(&self.counters.hits);
                    return Ok(Some(value));
                }
                Lookup::Null => {
                    bump(&self.counters.null_hits);
                    return Ok(None);
                }
                Lookup::Miss => {}
            }

            let Some(lock) = self
                .locks
                .try_acquire(&lock_key, self.config.rebuild_lock_lease)
                .await?
            else {
                debug!(key = %key, attempt, "waiting for cache rebuild lock");
                tokio::time::sleep(self.config.mutex_retry_delay).await;
                continue;
            };

            // Another holder may have filled the entry while we waited.
            let result = match self.lookup(&key).await {
                Ok(Lookup::Hit(value)) => {
                    bump(&self.counters.hits);
                    Ok(Some(value))
                }
                Ok(Lookup::Null) => {
                    bump(&self.counters.null_hits);
                    Ok(None)
                }
                Ok(Lookup::Miss) => {
                    bump(&self.counters.misses);
                    self.load_and_fill(&key, &id, loader, ttl).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = self.locks.release(lock).await {
                warn!(key = %key, error = %e, "failed to release cache lock");
            }
            return result;
        }

        warn!(key = %key, "gave up waiting for cache rebuild lock");
        Err(LockError::Unavailable { resource: lock_key }.into())
    }
}

async fn rebuild_entry<K, T, L>(
    store: &dyn KvStore,
    counters: &CacheCounters,
    key: &str,
    id: &K,
    loader: &L,
    ttl: Duration,
) -> RebuildOutcome
where
    K: Sync,
    T: Cacheable,
    L: EntityLoader<K, T> + ?Sized,
{
    if let Ok(Some(raw)) = store.get(key).await {
        let fresh = serde_json::from_str::<LogicalEnvelope<T>>(&raw)
            .map(|envelope| !envelope.is_expired(Utc::now()))
            .unwrap_or(false);
        if fresh {
            return RebuildOutcome::AlreadyFresh;
        }
    }

    bump(&counters.loads);
    match loader.load(id).await {
        Err(e) => RebuildOutcome::Failed(e.to_string()),
        Ok(None) => match store.delete(key).await {
            Ok(_) => RebuildOutcome::Evicted,
            Err(e) => RebuildOutcome::Failed(e.to_string()),
        },
        Ok(Some(value)) => {
            let envelope = LogicalEnvelope::wrap(value, ttl, Utc::now());
            let raw = match serde_json::to_string(&envelope) {
                Ok(raw) => raw,
                Err(e) => return RebuildOutcome::Failed(e.to_string()),
            };
            match store.set(key, &raw, None).await {
                Ok(()) => RebuildOutcome::Refreshed,
                Err(e) => RebuildOutcome::Failed(e.to_string()),
            }
        }
    }
}
