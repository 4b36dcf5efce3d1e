//! Cache traits: what can be cached and how it is loaded on a miss.

use async_trait::async_trait;
use flashsale_core::FlashSaleResult;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Values the cache client can store.
///
/// Blanket-implemented; any owned serde type qualifies.
pub trait Cacheable: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Loads an entity from the backing store on a cache miss.
///
/// Each entity's own data-access code supplies one. `Ok(None)` means the id
/// does not exist and makes the passthrough strategies write a null sentinel.
#[async_trait]
pub trait EntityLoader<K: Sync, T: Send>: Send + Sync {
    async fn load(&self, id: &K) -> FlashSaleResult<Option<T>>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads answered with a fresh payload.
    pub hits: u64,
    /// Reads answered from the null sentinel.
    pub null_hits: u64,
    /// Reads that found nothing usable in the cache.
    pub misses: u64,
    /// Logical-expire reads that returned a stale payload.
    pub stale_hits: u64,
    /// Loader invocations.
    pub loads: u64,
    /// Entries that failed to deserialize.
    pub corrupt_entries: u64,
    /// Background rebuilds handed to the pool.
    pub rebuilds_scheduled: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0), counting null and stale hits.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits + self.null_hits + self.stale_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}
