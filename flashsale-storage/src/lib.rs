//! Flash-sale Storage - Store Collaborators and Coordination Primitives
//!
//! Defines the fast-store traits (key-value, admission script, append log)
//! and the durable order repository, with in-process implementations, plus
//! the pieces built on top of the fast store: lease locks, the id generator
//! and the cache client.
//!
//! The `redis-backend` feature adds [`RedisStore`], the networked fast store
//! shared by every process of a deployment.

pub mod cache;
pub mod id_worker;
pub mod kv;
pub mod lock;
pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis_store;
pub mod repository;
pub mod script;
pub mod stream;

pub use cache::{
    CacheClient, CacheRead, CacheStats, Cacheable, EntityLoader, LogicalEnvelope, RebuildHandle,
    RebuildMetrics, RebuildOutcome, RebuildPool, NULL_SENTINEL,
};
pub use id_worker::{IdGenerator, IdParts};
pub use kv::KvStore;
pub use lock::DistributedLock;
pub use memory::MemoryStore;
#[cfg(feature = "redis-backend")]
pub use redis_store::{RedisStore, REDIS_URL_ENV};
pub use repository::{CreateOutcome, MemoryOrderRepository, OrderRepository};
pub use script::{
    AdmissionArgs, AdmissionKeys, ScriptStore, CODE_ADMITTED, CODE_DUPLICATE, CODE_SOLD_OUT,
    SECKILL_SCRIPT,
};
pub use stream::StreamStore;

