//! Error types for flash-sale operations

use crate::{OrderId, UserId, VoucherId};
use thiserror::Error;

/// Fast-store and durable-store errors.
///
/// Every variant is transient from the caller's point of view: the store
/// could not answer, so nothing can be concluded about the data.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Store operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("Unexpected reply from store for {operation}: {reason}")]
    Protocol { operation: String, reason: String },

    #[error("Wrong value type at key {key}: {reason}")]
    WrongType { key: String, reason: String },

    #[error("Consumer group {group} does not exist on stream {stream}")]
    NoSuchGroup { stream: String, group: String },

    #[error("Query failed: {reason}")]
    QueryFailed { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Validation errors, raised before any store mutation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Voucher {voucher_id} not found")]
    VoucherNotFound { voucher_id: VoucherId },

    #[error("Voucher {voucher_id} is already registered")]
    VoucherExists { voucher_id: VoucherId },

    #[error("Sale for voucher {voucher_id} has not started")]
    SaleNotStarted { voucher_id: VoucherId },

    #[error("Sale for voucher {voucher_id} has ended")]
    SaleEnded { voucher_id: VoucherId },

    #[error("Malformed queue entry {entry_id}: {reason}")]
    MalformedEntry { entry_id: String, reason: String },
}

/// Lock coordination errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("Lock unavailable for {resource}")]
    Unavailable { resource: String },
}

/// Durable state disagreed with the fast-store admission decision.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error(
        "Durable stock for voucher {voucher_id} not decremented \
         for admitted order {order_id} (user {user_id})"
    )]
    StockNotDecremented {
        order_id: OrderId,
        user_id: UserId,
        voucher_id: VoucherId,
    },
}

/// Cache client errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Failed to serialize value for {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Rebuild of {key} was cancelled before completion")]
    RebuildCancelled { key: String },

    #[error("Rebuild pool is shut down")]
    PoolClosed,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all flash-sale errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FlashSaleError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Consistency anomaly: {0}")]
    Consistency(#[from] ConsistencyError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl FlashSaleError {
    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, FlashSaleError::Store(_) | FlashSaleError::Lock(_))
    }
}

/// Result type alias for flash-sale operations.
pub type FlashSaleResult<T> = Result<T, FlashSaleError>;

/// Result type alias for store collaborators.
pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display_no_such_group() {
        let err = StoreError::NoSuchGroup {
            stream: "stream.orders".to_string(),
            group: "g1".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("stream.orders"));
        assert!(msg.contains("g1"));
    }

    #[test]
    fn test_consistency_error_display() {
        let err = ConsistencyError::StockNotDecremented {
            order_id: OrderId::new(9),
            user_id: UserId::new(3),
            voucher_id: VoucherId::new(5),
        };
        let msg = err.to_string();
        assert!(msg.contains("voucher 5"));
        assert!(msg.contains("order 9"));
        assert!(msg.contains("user 3"));
    }

    #[test]
    fn test_validation_error_display_sale_window() {
        let err = ValidationError::SaleNotStarted {
            voucher_id: VoucherId::new(11),
        };
        assert!(err.to_string().contains("not started"));
    }

    #[test]
    fn test_master_error_from_variants() {
        let store = FlashSaleError::from(StoreError::LockPoisoned);
        assert!(matches!(store, FlashSaleError::Store(_)));
        assert!(store.is_transient());

        let lock = FlashSaleError::from(LockError::Unavailable {
            resource: "lock:order:1".to_string(),
        });
        assert!(lock.is_transient());

        let validation = FlashSaleError::from(ValidationError::RequiredFieldMissing {
            field: "userId".to_string(),
        });
        assert!(!validation.is_transient());

        let cache = FlashSaleError::from(CacheError::PoolClosed);
        assert!(matches!(cache, FlashSaleError::Cache(_)));
    }
}
