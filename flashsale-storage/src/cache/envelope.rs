//! Logical-expiration envelope and read results.
//!
//! A logically expiring entry is stored without a store TTL and carries its
//! freshness deadline in-band:
//!
//! ```text
//! {"data": <payload>, "expireTime": "2024-03-07T12:30:00Z"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::rebuild::RebuildHandle;

/// Wire envelope of a logically expiring cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalEnvelope<T> {
    pub data: T,
    #[serde(rename = "expireTime")]
    pub expire_time: DateTime<Utc>,
}

impl<T> LogicalEnvelope<T> {
    /// Wrap a payload that stays fresh for `ttl` from `now`.
    pub fn wrap(data: T, ttl: Duration, now: DateTime<Utc>) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            data,
            expire_time: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_time <= now
    }
}

/// Result of a logical-expire read.
///
/// Carries whether the payload was already past its freshness deadline and,
/// when this read won the rebuild lock, a handle on the background rebuild.
#[derive(Debug)]
pub struct CacheRead<T> {
    value: T,
    expire_time: DateTime<Utc>,
    stale: bool,
    rebuild: Option<RebuildHandle>,
}

impl<T> CacheRead<T> {
    pub fn fresh(value: T, expire_time: DateTime<Utc>) -> Self {
        Self {
            value,
            expire_time,
            stale: false,
            rebuild: None,
        }
    }

    pub fn stale(value: T, expire_time: DateTime<Utc>, rebuild: Option<RebuildHandle>) -> Self {
        Self {
            value,
            expire_time,
            stale: true,
            rebuild,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn expire_time(&self) -> DateTime<Utc> {
        self.expire_time
    }

    /// How long past its deadline the payload is, zero when fresh.
    pub fn staleness(&self, now: DateTime<Utc>) -> Duration {
        (now - self.expire_time).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether this read triggered the rebuild.
    pub fn triggered_rebuild(&self) -> bool {
        self.rebuild.is_some()
    }

    /// Take the rebuild handle to await its completion.
    pub fn take_rebuild(&mut self) -> Option<RebuildHandle> {
        self.rebuild.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let now = Utc::now();
        let env = LogicalEnvelope::wrap("shop".to_string(), Duration::from_secs(30), now);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["data"], "shop");
        assert!(json.get("expireTime").is_some());
        assert!(!env.is_expired(now));
        assert!(env.is_expired(now + chrono::Duration::seconds(30)));
    }

    #[test]
    fn test_staleness() {
        let now = Utc::now();
        let read = CacheRead::stale(1, now - chrono::Duration::seconds(5), None);
        assert!(read.is_stale());
        assert!(!read.triggered_rebuild());
        assert_eq!(read.staleness(now), Duration::from_secs(5));
        assert_eq!(CacheRead::fresh(1, now).staleness(now), Duration::ZERO);
    }
}
