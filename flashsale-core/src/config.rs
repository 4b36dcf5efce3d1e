//! Configuration types

use crate::constants::*;
use crate::ConfigError;
use std::str::FromStr;
use std::time::Duration;

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_string_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn require_positive(field: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: format!("{:?}", value),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingRequired {
            field: field.to_string(),
        });
    }
    Ok(())
}

// ============================================================================
// CACHE
// ============================================================================

/// Configuration for the cache client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// TTL of the empty-string sentinel written for absent ids.
    pub null_ttl: Duration,
    /// Default TTL for cached entities.
    pub default_ttl: Duration,
    /// Lease of the single-rebuilder lock.
    pub rebuild_lock_lease: Duration,
    /// Size of the background rebuild pool.
    pub rebuild_workers: usize,
    /// Sleep between retries when another caller holds the mutex-strategy lock.
    pub mutex_retry_delay: Duration,
    /// Retries before the mutex strategy gives up with `LockUnavailable`.
    pub mutex_max_retries: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            null_ttl: Duration::from_secs(DEFAULT_CACHE_NULL_TTL_SECS),
            default_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            rebuild_lock_lease: Duration::from_secs(DEFAULT_CACHE_LOCK_LEASE_SECS),
            rebuild_workers: DEFAULT_REBUILD_WORKERS,
            mutex_retry_delay: Duration::from_millis(DEFAULT_MUTEX_RETRY_DELAY_MS),
            mutex_max_retries: DEFAULT_MUTEX_MAX_RETRIES,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create CacheConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `FLASHSALE_CACHE_NULL_TTL_SECS` (default: 120)
    /// - `FLASHSALE_CACHE_TTL_SECS` (default: 1800)
    /// - `FLASHSALE_CACHE_LOCK_LEASE_SECS` (default: 10)
    /// - `FLASHSALE_CACHE_REBUILD_WORKERS` (default: 10)
    pub fn from_env() -> Self {
        Self {
            null_ttl: Duration::from_secs(env_or(
                "FLASHSALE_CACHE_NULL_TTL_SECS",
                DEFAULT_CACHE_NULL_TTL_SECS,
            )),
            default_ttl: Duration::from_secs(env_or(
                "FLASHSALE_CACHE_TTL_SECS",
                DEFAULT_CACHE_TTL_SECS,
            )),
            rebuild_lock_lease: Duration::from_secs(env_or(
                "FLASHSALE_CACHE_LOCK_LEASE_SECS",
                DEFAULT_CACHE_LOCK_LEASE_SECS,
            )),
            rebuild_workers: env_or("FLASHSALE_CACHE_REBUILD_WORKERS", DEFAULT_REBUILD_WORKERS),
            ..Self::default()
        }
    }

    pub fn with_null_ttl(mut self, ttl: Duration) -> Self {
        self.null_ttl = ttl;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_rebuild_lock_lease(mut self, lease: Duration) -> Self {
        self.rebuild_lock_lease = lease;
        self
    }

    pub fn with_rebuild_workers(mut self, workers: usize) -> Self {
        self.rebuild_workers = workers;
        self
    }

    pub fn with_mutex_retry(mut self, delay: Duration, max_retries: u32) -> Self {
        self.mutex_retry_delay = delay;
        self.mutex_max_retries = max_retries;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("cache.null_ttl", self.null_ttl)?;
        require_positive("cache.default_ttl", self.default_ttl)?;
        require_positive("cache.rebuild_lock_lease", self.rebuild_lock_lease)?;
        if self.rebuild_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.rebuild_workers".to_string(),
                value: "0".to_string(),
                reason: "at least one rebuild worker is required".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// QUEUE
// ============================================================================

/// Configuration for the durable order queue consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub stream_key: String,
    pub group: String,
    pub consumer: String,
    /// Bounded wait of one blocking read.
    pub block_timeout: Duration,
    /// Sleep before retrying the same pending entry.
    pub recovery_backoff: Duration,
    /// Dead-letter a pending entry after this many deliveries. `None` retries forever.
    pub max_delivery_attempts: Option<u32>,
    /// How long shutdown waits for the worker before aborting it.
    pub shutdown_grace: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stream_key: ORDER_STREAM_KEY.to_string(),
            group: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer: DEFAULT_CONSUMER_NAME.to_string(),
            block_timeout: Duration::from_millis(DEFAULT_QUEUE_BLOCK_MS),
            recovery_backoff: Duration::from_millis(DEFAULT_RECOVERY_BACKOFF_MS),
            max_delivery_attempts: None,
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create QueueConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `FLASHSALE_QUEUE_STREAM` (default: stream.orders)
    /// - `FLASHSALE_QUEUE_GROUP` (default: g1)
    /// - `FLASHSALE_QUEUE_CONSUMER` (default: c1)
    /// - `FLASHSALE_QUEUE_BLOCK_MS` (default: 2000)
    /// - `FLASHSALE_QUEUE_RECOVERY_BACKOFF_MS` (default: 20)
    /// - `FLASHSALE_QUEUE_MAX_DELIVERY_ATTEMPTS` (default: unset, retry forever)
    /// - `FLASHSALE_SHUTDOWN_GRACE_SECS` (default: 10)
    pub fn from_env() -> Self {
        Self {
            stream_key: env_string_or("FLASHSALE_QUEUE_STREAM", ORDER_STREAM_KEY),
            group: env_string_or("FLASHSALE_QUEUE_GROUP", DEFAULT_CONSUMER_GROUP),
            consumer: env_string_or("FLASHSALE_QUEUE_CONSUMER", DEFAULT_CONSUMER_NAME),
            block_timeout: Duration::from_millis(env_or(
                "FLASHSALE_QUEUE_BLOCK_MS",
                DEFAULT_QUEUE_BLOCK_MS,
            )),
            recovery_backoff: Duration::from_millis(env_or(
                "FLASHSALE_QUEUE_RECOVERY_BACKOFF_MS",
                DEFAULT_RECOVERY_BACKOFF_MS,
            )),
            max_delivery_attempts: std::env::var("FLASHSALE_QUEUE_MAX_DELIVERY_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok()),
            shutdown_grace: Duration::from_secs(env_or(
                "FLASHSALE_SHUTDOWN_GRACE_SECS",
                DEFAULT_SHUTDOWN_GRACE_SECS,
            )),
        }
    }

    /// Short waits for development and tests.
    pub fn development() -> Self {
        Self {
            block_timeout: Duration::from_millis(100),
            recovery_backoff: Duration::from_millis(5),
            shutdown_grace: Duration::from_secs(2),
            ..Self::default()
        }
    }

    pub fn with_stream(mut self, stream_key: impl Into<String>) -> Self {
        self.stream_key = stream_key.into();
        self
    }

    pub fn with_consumer(mut self, group: impl Into<String>, consumer: impl Into<String>) -> Self {
        self.group = group.into();
        self.consumer = consumer.into();
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    pub fn with_recovery_backoff(mut self, backoff: Duration) -> Self {
        self.recovery_backoff = backoff;
        self
    }

    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = Some(attempts);
        self
    }

    /// Dead-letter stream for this queue.
    pub fn dead_letter_key(&self) -> String {
        format!("{}{}", self.stream_key, DEAD_LETTER_SUFFIX)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_non_empty("queue.stream_key", &self.stream_key)?;
        require_non_empty("queue.group", &self.group)?;
        require_non_empty("queue.consumer", &self.consumer)?;
        require_positive("queue.block_timeout", self.block_timeout)?;
        if self.max_delivery_attempts == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "queue.max_delivery_attempts".to_string(),
                value: "0".to_string(),
                reason: "must allow at least one delivery".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// LOCKS
// ============================================================================

/// Configuration for per-user order locks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    pub order_lock_lease: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            order_lock_lease: Duration::from_secs(DEFAULT_ORDER_LOCK_LEASE_SECS),
        }
    }
}

impl LockConfig {
    /// - `FLASHSALE_ORDER_LOCK_LEASE_SECS` (default: 30)
    pub fn from_env() -> Self {
        Self {
            order_lock_lease: Duration::from_secs(env_or(
                "FLASHSALE_ORDER_LOCK_LEASE_SECS",
                DEFAULT_ORDER_LOCK_LEASE_SECS,
            )),
        }
    }
}

// ============================================================================
// ID GENERATOR
// ============================================================================

/// Configuration for the id generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdConfig {
    /// Seconds since the Unix epoch that map to timestamp zero.
    pub epoch_secs: i64,
}

impl Default for IdConfig {
    fn default() -> Self {
        Self {
            epoch_secs: DEFAULT_ID_EPOCH_SECS,
        }
    }
}

// ============================================================================
// MASTER CONFIG
// ============================================================================

/// Master configuration struct.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashSaleConfig {
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    pub lock: LockConfig,
    pub id: IdConfig,
}

impl FlashSaleConfig {
    pub fn from_env() -> Self {
        Self {
            cache: CacheConfig::from_env(),
            queue: QueueConfig::from_env(),
            lock: LockConfig::from_env(),
            id: IdConfig {
                epoch_secs: env_or("FLASHSALE_ID_EPOCH_SECS", DEFAULT_ID_EPOCH_SECS),
            },
        }
    }

    /// Configuration for development/testing with short waits.
    pub fn development() -> Self {
        Self {
            queue: QueueConfig::development(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        self.queue.validate()?;
        require_positive("lock.order_lock_lease", self.lock.order_lock_lease)?;
        Ok(())
    }
}
