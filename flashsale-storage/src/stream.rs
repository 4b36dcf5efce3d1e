//! Append-log store with consumer groups.
//!
//! Semantics follow Redis streams: entries are appended with store-assigned
//! monotonic ids, a consumer group delivers each entry to one consumer, and
//! delivered entries stay on that consumer's pending list until acknowledged.

use async_trait::async_trait;
use flashsale_core::{EntryId, QueueEntry, QueueFields, ReadOffset, StoreResult};
use std::time::Duration;

/// Durable append log with consumer-group delivery.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Create a consumer group reading from the start of the stream,
    /// creating the stream if needed. Succeeds if the group already exists.
    async fn create_group(&self, stream_key: &str, group: &str) -> StoreResult<()>;

    /// Append an entry and return its id.
    async fn append(&self, stream_key: &str, fields: &QueueFields) -> StoreResult<EntryId>;

    /// Read at most one entry for `consumer` in `group`.
    ///
    /// With `ReadOffset::NextUndelivered` the call waits up to `block` for a
    /// new entry and returns `None` on timeout. With `ReadOffset::Pending` it
    /// returns the oldest entry on this consumer's pending list, or `None`
    /// when the list is empty, without waiting.
    async fn read_group(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        offset: ReadOffset,
        block: Duration,
    ) -> StoreResult<Option<QueueEntry>>;

    /// Acknowledge an entry, removing it from the pending list.
    /// Returns whether the entry was pending.
    async fn ack(&self, stream_key: &str, group: &str, id: EntryId) -> StoreResult<bool>;

    /// Number of delivered-but-unacknowledged entries in the group.
    async fn pending_count(&self, stream_key: &str, group: &str) -> StoreResult<u64>;
}
