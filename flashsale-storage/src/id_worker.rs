//! Cluster-wide unique id generator.
//!
//! An id is `(seconds since epoch) << 32 | counter`, where the counter is a
//! fast-store integer scoped to the business tag and the UTC day. Ids are
//! roughly time ordered and never collide while the counter store is the
//! single source of sequence numbers. There is no local fallback when the
//! store is unreachable.

use chrono::{DateTime, Utc};
use flashsale_core::constants::{ID_COUNTER_KEY, ID_COUNT_BITS};
use flashsale_core::{IdConfig, StoreError, StoreResult};
use std::sync::Arc;

use crate::kv::KvStore;

const COUNT_MASK: u64 = (1 << ID_COUNT_BITS) - 1;

/// Timestamp and sequence halves of a generated id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdParts {
    /// Seconds since the generator epoch.
    pub timestamp: u64,
    pub sequence: u32,
}

impl IdParts {
    pub fn decode(id: u64) -> Self {
        Self {
            timestamp: id >> ID_COUNT_BITS,
            sequence: (id & COUNT_MASK) as u32,
        }
    }

    pub fn encode(self) -> u64 {
        (self.timestamp << ID_COUNT_BITS) | u64::from(self.sequence)
    }
}

#[derive(Clone)]
pub struct IdGenerator {
    store: Arc<dyn KvStore>,
    epoch_secs: i64,
}

impl std::fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdGenerator")
            .field("epoch_secs", &self.epoch_secs)
            .finish_non_exhaustive()
    }
}

impl IdGenerator {
    pub fn new(store: Arc<dyn KvStore>, config: &IdConfig) -> Self {
        Self {
            store,
            epoch_secs: config.epoch_secs,
        }
    }

    /// Counter key for a tag on a given day: `icr:<tag>:yyyy:MM:dd`.
    pub fn counter_key(biz_tag: &str, now: DateTime<Utc>) -> String {
        format!("{}{}:{}", ID_COUNTER_KEY, biz_tag, now.format("%Y:%m:%d"))
    }

    /// Next id for `biz_tag`. Fails if the counter store fails.
    pub async fn next_id(&self, biz_tag: &str) -> StoreResult<u64> {
        self.next_id_at(biz_tag, Utc::now()).await
    }

    pub async fn next_id_at(&self, biz_tag: &str, now: DateTime<Utc>) -> StoreResult<u64> {
        let elapsed = now.timestamp() - self.epoch_secs;
        if elapsed < 0 {
            return Err(StoreError::Protocol {
                operation: "next_id".to_string(),
                reason: format!("clock is before the id epoch {}", self.epoch_secs),
            });
        }

        let key = Self::counter_key(biz_tag, now);
        let count = self.store.incr(&key).await?;
        let sequence = u32::try_from(count).map_err(|_| StoreError::Protocol {
            operation: "next_id".to_string(),
            reason: format!("counter {} out of range: {}", key, count),
        })?;

        Ok(IdParts {
            timestamp: elapsed as u64,
            sequence,
        }
        .encode())
    }
}
