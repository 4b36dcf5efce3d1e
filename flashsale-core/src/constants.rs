//! Constants for the flash-sale pipeline
//!
//! Key prefixes, queue names and default timings. Centralizing constants
//! makes them easy to find, modify, and test.

// ============================================================================
// FAST-STORE KEYS
// ============================================================================

/// Remaining stock counter: `seckill:stock:<voucherId>`
pub const SECKILL_STOCK_KEY: &str = "seckill:stock:";

/// Set of users admitted for a voucher: `seckill:order:<voucherId>`
pub const SECKILL_ORDER_KEY: &str = "seckill:order:";

/// Per-user order creation lock: `lock:order:<userId>`
pub const LOCK_ORDER_KEY: &str = "lock:order:";

/// Cache rebuild lock: `lock:cache:<prefix><id>`
pub const LOCK_CACHE_KEY: &str = "lock:cache:";

/// Cache prefix for seckill vouchers: `cache:voucher:<voucherId>`
pub const CACHE_VOUCHER_KEY: &str = "cache:voucher:";

/// Cache prefix for hot vouchers held in logical-expire envelopes:
/// `cache:hot-voucher:<voucherId>`. Passthrough reads store bare values, so
/// the two strategies never share a prefix.
pub const CACHE_HOT_VOUCHER_KEY: &str = "cache:hot-voucher:";

/// Daily id counter: `icr:<bizTag>:<yyyy:MM:dd>`
pub const ID_COUNTER_KEY: &str = "icr:";

/// Business tag used for order ids.
pub const ORDER_BIZ_TAG: &str = "order";

// ============================================================================
// QUEUE
// ============================================================================

/// Durable order queue stream.
pub const ORDER_STREAM_KEY: &str = "stream.orders";

/// Suffix appended to a stream key for its dead-letter stream.
pub const DEAD_LETTER_SUFFIX: &str = ".dlq";

/// Default consumer group.
pub const DEFAULT_CONSUMER_GROUP: &str = "g1";

/// Default consumer name.
pub const DEFAULT_CONSUMER_NAME: &str = "c1";

/// Default bounded wait for a blocking queue read (2 seconds)
pub const DEFAULT_QUEUE_BLOCK_MS: u64 = 2_000;

/// Default sleep between recovery retries of the same entry (20 ms)
pub const DEFAULT_RECOVERY_BACKOFF_MS: u64 = 20;

/// Default bounded wait for the worker to stop before it is aborted (10 seconds)
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

// ============================================================================
// CACHE
// ============================================================================

/// Negative-cache sentinel TTL (2 minutes)
pub const DEFAULT_CACHE_NULL_TTL_SECS: u64 = 120;

/// Entity cache TTL (30 minutes)
pub const DEFAULT_CACHE_TTL_SECS: u64 = 1_800;

/// Cache rebuild lock lease (10 seconds)
pub const DEFAULT_CACHE_LOCK_LEASE_SECS: u64 = 10;

/// Rebuild worker pool size
pub const DEFAULT_REBUILD_WORKERS: usize = 10;

/// Sleep between mutex-strategy retries (50 ms)
pub const DEFAULT_MUTEX_RETRY_DELAY_MS: u64 = 50;

/// Mutex-strategy retries before giving up
pub const DEFAULT_MUTEX_MAX_RETRIES: u32 = 100;

// ============================================================================
// LOCKS
// ============================================================================

/// Per-user order lock lease (30 seconds)
pub const DEFAULT_ORDER_LOCK_LEASE_SECS: u64 = 30;

// ============================================================================
// ID GENERATOR
// ============================================================================

/// Id epoch: 2022-01-01T00:00:00Z
pub const DEFAULT_ID_EPOCH_SECS: i64 = 1_640_995_200;

/// Low bits reserved for the daily counter.
pub const ID_COUNT_BITS: u32 = 32;
