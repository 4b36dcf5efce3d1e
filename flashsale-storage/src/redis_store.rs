//! Redis fast store.
//!
//! One [`RedisStore`] implements [`KvStore`], [`ScriptStore`] and
//! [`StreamStore`] against a Redis deployment, so stock counters, dedup sets,
//! cache entries, lease locks, id counters and the order stream are shared by
//! every process pointed at the same server.
//!
//! Key patterns are the ones the rest of the workspace already uses:
//! - `seckill:stock:<voucherId>` -> stock counter (string)
//! - `seckill:order:<voucherId>` -> admitted users (set)
//! - `stream.orders` -> admitted orders (stream, group `g1`)
//! - `lock:*`, `cache:*`, `icr:*` -> locks, cache entries, id counters
//!
//! Admission runs [`SECKILL_SCRIPT`] through `EVALSHA`, falling back to
//! `EVAL` the first time a server has not seen it.
//!
//! Blocking stream reads use their own connection. A `BLOCK` read holds a
//! multiplexed connection until it returns, which would stall admissions.

use ::redis::aio::ConnectionManager;
use ::redis::streams::{StreamId, StreamPendingCountReply, StreamPendingReply, StreamReadReply};
use ::redis::{Client, ErrorKind, RedisError, Script, Value};
use async_trait::async_trait;
use flashsale_core::{EntryId, QueueEntry, QueueFields, ReadOffset, StoreError, StoreResult};
use std::time::Duration;
use tracing::{debug, info};

use crate::kv::KvStore;
use crate::script::{AdmissionArgs, AdmissionKeys, ScriptStore, SECKILL_SCRIPT};
use crate::stream::StreamStore;

/// Environment variable holding the Redis connection URL.
pub const REDIS_URL_ENV: &str = "FLASHSALE_REDIS_URL";

/// Delete `KEYS[1]` only while it holds `ARGV[1]`.
const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
end
return 0
"#;

/// Redis-backed fast store.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    blocking: ConnectionManager,
    admission: Script,
    compare_and_delete: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("admission_sha", &self.admission.get_hash())
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to `url` (`redis://[:password@]host:port[/db]`).
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url).map_err(|e| StoreError::Unavailable {
            reason: format!("invalid Redis URL: {}", e),
        })?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| store_error("connect", "", e))?;
        let blocking = ConnectionManager::new(client)
            .await
            .map_err(|e| store_error("connect", "", e))?;

        let store = Self {
            conn,
            blocking,
            admission: Script::new(SECKILL_SCRIPT),
            compare_and_delete: Script::new(COMPARE_AND_DELETE_SCRIPT),
        };
        info!(admission_sha = %store.admission.get_hash(), "Connected to Redis");
        Ok(store)
    }

    /// Connect to the URL in `FLASHSALE_REDIS_URL`, or `None` when unset.
    pub async fn from_env() -> StoreResult<Option<Self>> {
        match std::env::var(REDIS_URL_ENV) {
            Ok(url) => Self::connect(&url).await.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Delivery count of one pending entry, from `XPENDING`.
    async fn delivery_count(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        id: EntryId,
    ) -> StoreResult<u32> {
        let mut conn = self.conn.clone();
        let id = id.to_string();
        let reply: StreamPendingCountReply = ::redis::cmd("XPENDING")
            .arg(stream_key)
            .arg(group)
            .arg(&id)
            .arg(&id)
            .arg(1)
            .arg(consumer)
            .query_async(&mut conn)
            .await
            .map_err(|e| stream_error("XPENDING", stream_key, group, e))?;
        Ok(reply
            .ids
            .first()
            .map(|pending| u32::try_from(pending.times_delivered).unwrap_or(u32::MAX))
            .unwrap_or(1))
    }
}

// ============================================================================
// ERROR MAPPING
// ============================================================================

fn store_error(operation: &str, key: &str, err: RedisError) -> StoreError {
    if err.is_timeout() {
        return StoreError::Timeout {
            operation: operation.to_string(),
        };
    }
    if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
        return StoreError::Unavailable {
            reason: format!("{}: {}", operation, err),
        };
    }
    if err.code() == Some("WRONGTYPE") {
        return StoreError::WrongType {
            key: key.to_string(),
            reason: err.to_string(),
        };
    }
    match err.kind() {
        ErrorKind::TypeError => StoreError::Protocol {
            operation: operation.to_string(),
            reason: err.to_string(),
        },
        _ => StoreError::QueryFailed {
            reason: format!("{}: {}", operation, err),
        },
    }
}

fn stream_error(operation: &str, stream: &str, group: &str, err: RedisError) -> StoreError {
    if err.code() == Some("NOGROUP") {
        return StoreError::NoSuchGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
    }
    store_error(operation, stream, err)
}

// ============================================================================
// REPLY DECODING
// ============================================================================

/// `PX` argument for a TTL. Redis rejects zero, so sub-millisecond TTLs
/// round up to one millisecond.
fn px_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// `BLOCK` argument for a read wait. `None` for a zero wait: `BLOCK 0`
/// means forever in Redis.
fn block_millis(block: Duration) -> Option<u64> {
    let millis = u64::try_from(block.as_millis()).unwrap_or(u64::MAX);
    (millis > 0).then_some(millis)
}

fn parse_entry_id(operation: &str, raw: &str) -> StoreResult<EntryId> {
    raw.parse().map_err(|e| StoreError::Protocol {
        operation: operation.to_string(),
        reason: format!("bad stream id {:?}: {}", raw, e),
    })
}

/// Decode stream entry fields. Non-string values are a protocol error.
fn decode_fields(entry: &StreamId) -> StoreResult<QueueFields> {
    entry
        .map
        .iter()
        .map(|(field, value)| {
            ::redis::from_redis_value::<String>(value)
                .map(|value| (field.clone(), value))
                .map_err(|e| StoreError::Protocol {
                    operation: "XREADGROUP".to_string(),
                    reason: format!("field {} of entry {}: {}", field, entry.id, e),
                })
        })
        .collect()
}

fn first_entry(reply: Option<StreamReadReply>) -> Option<StreamId> {
    reply?.keys.into_iter().next()?.ids.into_iter().next()
}

// ============================================================================
// STORE TRAITS
// ============================================================================

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        ::redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("GET", key, e))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(px_millis(ttl));
        }
        let _: Value = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("SET", key, e))?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(px_millis(ttl));
        }
        let reply: Value = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("SET NX", key, e))?;
        Ok(!matches!(reply, Value::Nil))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = ::redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("DEL", key, e))?;
        Ok(removed > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.compare_and_delete.prepare_invoke();
        invocation.key(key).arg(expected);
        let removed: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("compare-and-delete", key, e))?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        ::redis::cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("INCR", key, e))
    }
}

#[async_trait]
impl ScriptStore for RedisStore {
    async fn eval_admission(
        &self,
        keys: &AdmissionKeys,
        args: &AdmissionArgs,
    ) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        let mut invocation = self.admission.prepare_invoke();
        invocation
            .key(keys.stock_key.as_str())
            .key(keys.order_set_key.as_str())
            .key(keys.stream_key.as_str())
            .arg(args.voucher_id.get())
            .arg(args.user_id.get())
            .arg(args.order_id.get());
        let code: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("admission script", &keys.stock_key, e))?;
        debug!(
            voucher_id = %args.voucher_id,
            user_id = %args.user_id,
            code,
            "admission script evaluated"
        );
        Ok(code)
    }
}

#[async_trait]
impl StreamStore for RedisStore {
    async fn create_group(&self, stream_key: &str, group: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let result: Result<Value, RedisError> = ::redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream_key)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(_) => {
                info!(stream = %stream_key, group = %group, "consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(store_error("XGROUP CREATE", stream_key, e)),
        }
    }

    async fn append(&self, stream_key: &str, fields: &QueueFields) -> StoreResult<EntryId> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("XADD");
        cmd.arg(stream_key).arg("*");
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        let id: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("XADD", stream_key, e))?;
        parse_entry_id("XADD", &id)
    }

    async fn read_group(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        offset: ReadOffset,
        block: Duration,
    ) -> StoreResult<Option<QueueEntry>> {
        let mut cmd = ::redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(1);
        let (mut conn, start) = match offset {
            ReadOffset::NextUndelivered => {
                if let Some(millis) = block_millis(block) {
                    cmd.arg("BLOCK").arg(millis);
                }
                (self.blocking.clone(), ">")
            }
            ReadOffset::Pending => (self.conn.clone(), "0"),
        };
        cmd.arg("STREAMS").arg(stream_key).arg(start);

        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| stream_error("XREADGROUP", stream_key, group, e))?;
        let Some(raw) = first_entry(reply) else {
            return Ok(None);
        };

        let id = parse_entry_id("XREADGROUP", &raw.id)?;
        let fields = decode_fields(&raw)?;
        let delivery_count = match offset {
            ReadOffset::NextUndelivered => 1,
            ReadOffset::Pending => self.delivery_count(stream_key, group, consumer, id).await?,
        };
        Ok(Some(QueueEntry {
            stream_key: stream_key.to_string(),
            id,
            fields,
            delivery_count,
        }))
    }

    async fn ack(&self, stream_key: &str, group: &str, id: EntryId) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let acked: i64 = ::redis::cmd("XACK")
            .arg(stream_key)
            .arg(group)
            .arg(id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| stream_error("XACK", stream_key, group, e))?;
        Ok(acked > 0)
    }

    async fn pending_count(&self, stream_key: &str, group: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingReply = ::redis::cmd("XPENDING")
            .arg(stream_key)
            .arg(group)
            .query_async(&mut conn)
            .await
            .map_err(|e| stream_error("XPENDING", stream_key, group, e))?;
        Ok(reply.count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn stream_id(id: &str, fields: &[(&str, Value)]) -> StreamId {
        StreamId {
            id: id.to_string(),
            map: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn test_px_rounds_up_to_one_millisecond() {
        assert_eq!(px_millis(Duration::ZERO), 1);
        assert_eq!(px_millis(Duration::from_micros(300)), 1);
        assert_eq!(px_millis(Duration::from_secs(10)), 10_000);
    }

    #[test]
    fn test_zero_block_never_blocks_forever() {
        assert_eq!(block_millis(Duration::ZERO), None);
        assert_eq!(block_millis(Duration::from_millis(2000)), Some(2000));
    }

    #[test]
    fn test_entry_id_parse() {
        assert_eq!(
            parse_entry_id("XADD", "1700000000000-3").unwrap(),
            EntryId::new(1_700_000_000_000, 3)
        );
        assert!(matches!(
            parse_entry_id("XADD", "not-an-id"),
            Err(StoreError::Protocol { .. })
        ));
    }

    #[test]
    fn test_decode_fields() {
        let raw = stream_id(
            "5-0",
            &[
                ("userId", Value::BulkString(b"7".to_vec())),
                ("voucherId", Value::BulkString(b"3".to_vec())),
                ("id", Value::BulkString(b"100".to_vec())),
            ],
        );
        let fields = decode_fields(&raw).unwrap();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields["userId"], "7");
        assert_eq!(fields["id"], "100");

        let nested = stream_id("5-1", &[("userId", Value::Array(vec![]))]);
        assert!(matches!(
            decode_fields(&nested),
            Err(StoreError::Protocol { .. })
        ));
    }

    #[test]
    fn test_empty_read_reply_is_none() {
        assert!(first_entry(None).is_none());
        assert!(first_entry(Some(StreamReadReply { keys: vec![] })).is_none());
    }
}
