//! Cache layer protecting the durable store.
//!
//! The client guards against three failure modes of a naive read-through
//! cache:
//!
//! - **Penetration**: lookups for ids that exist nowhere. Passthrough reads
//!   cache the absence as an empty-string sentinel with a short TTL.
//! - **Breakdown**: a hot key expiring under load. Logical-expire reads keep
//!   the entry in the store and serve it stale while one background task
//!   reloads it; the mutex strategy lets only the lock holder load.
//! - **Rebuild storms**: many keys expiring together. Rebuilds share a
//!   bounded [`RebuildPool`].
//!
//! # Example
//!
//! ```ignore
//! let voucher = cache
//!     .query_with_pass_through(CACHE_VOUCHER_KEY, voucher_id, &loader, config.default_ttl)
//!     .await?;
//!
//! let mut read = cache
//!     .query_with_logical_expire(CACHE_HOT_VOUCHER_KEY, voucher_id, loader, ttl)
//!     .await?;
//! if let Some(read) = read.as_mut() {
//!     if let Some(rebuild) = read.take_rebuild() {
//!         tracing::debug!(key = rebuild.key(), "triggered rebuild");
//!     }
//! }
//! ```

pub mod client;
pub mod envelope;
pub mod rebuild;
pub mod traits;

pub use client::{CacheClient, NULL_SENTINEL};
pub use envelope::{CacheRead, LogicalEnvelope};
pub use rebuild::{RebuildHandle, RebuildMetrics, RebuildOutcome, RebuildPool};
pub use traits::{CacheStats, Cacheable, EntityLoader};
