//! Key-value store collaborator.
//!
//! The fast store holds stock counters, dedup sets, cache entries, locks and
//! id counters. Values are strings, as they would be in Redis.

use async_trait::async_trait;
use flashsale_core::StoreResult;
use std::time::Duration;

/// Fast key-value store with TTL and conditional writes.
///
/// Implementations must be safe for concurrent use; every method is a single
/// atomic store operation.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get a string value. `None` when the key is absent or expired.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set a string value, replacing any previous value and TTL.
    ///
    /// `ttl = None` stores the value without expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Set the value only if the key is absent (`SET key value NX [PX ttl]`).
    ///
    /// Returns whether the value was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> StoreResult<bool>;

    /// Delete a key. Returns whether a key was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Delete a key only if it currently holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Atomically increment an integer counter, creating it at zero.
    /// Returns the value after the increment.
    async fn incr(&self, key: &str) -> StoreResult<i64>;
}
