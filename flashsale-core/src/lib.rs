//! Flash-sale Core - Entity Types
//!
//! Pure data structures shared by every other crate: identifiers, vouchers,
//! orders, queue entries, admission outcomes, the lease-lock typestate,
//! configuration and the error taxonomy. This crate performs no I/O.

pub mod config;
pub mod constants;
pub mod entities;
pub mod error;
pub mod identity;
pub mod lock;

pub use config::{CacheConfig, FlashSaleConfig, IdConfig, LockConfig, QueueConfig};
pub use entities::{
    Admission, EntryId, QueueEntry, QueueFields, ReadOffset, Rejection, SeckillVoucher,
    VoucherOrder, FIELD_ORDER_ID, FIELD_USER_ID, FIELD_VOUCHER_ID,
};
pub use error::{
    CacheError, ConfigError, ConsistencyError, FlashSaleError, FlashSaleResult, LockError,
    StoreError, StoreResult, ValidationError,
};
pub use identity::{IdParseError, OrderId, Timestamp, UserId, VoucherId};
pub use lock::{Acquired, Lock, LockData, LockState, Released};
