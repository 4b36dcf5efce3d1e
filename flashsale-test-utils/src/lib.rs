//! Flash-sale Test Utilities
//!
//! Shared test infrastructure for the workspace:
//! - Proptest generators for ids, vouchers and request batches
//! - Test doubles for loaders and repositories
//! - Fixtures for common voucher and order shapes
//! - Assertions over admission results and errors

pub use flashsale_core::{
    Admission, FlashSaleConfig, FlashSaleError, FlashSaleResult, OrderId, Rejection,
    SeckillVoucher, StoreError, StoreResult, Timestamp, UserId, ValidationError, VoucherId,
    VoucherOrder,
};
pub use flashsale_storage::{MemoryOrderRepository, MemoryStore};

use async_trait::async_trait;
use flashsale_storage::{CreateOutcome, EntityLoader, OrderRepository};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// TEST DOUBLES
// ============================================================================

/// Loader backed by a fixed map that counts how often it is called.
#[derive(Debug)]
pub struct CountingLoader<K, T> {
    values: Mutex<HashMap<K, T>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl<K: Hash + Eq, T: Clone> CountingLoader<K, T> {
    pub fn new(values: impl IntoIterator<Item = (K, T)>) -> Self {
        Self {
            values: Mutex::new(values.into_iter().collect()),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    /// Sleep this long inside every load, to widen race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Replace the value the next load returns for `id`.
    pub fn put(&self, id: K, value: T) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(id, value);
        }
    }

    pub fn remove(&self, id: &K) {
        if let Ok(mut values) = self.values.lock() {
            values.remove(id);
        }
    }
}

#[async_trait]
impl<K, T> EntityLoader<K, T> for CountingLoader<K, T>
where
    K: Hash + Eq + Send + Sync,
    T: Clone + Send + Sync,
{
    async fn load(&self, id: &K) -> FlashSaleResult<Option<T>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let values = self.values.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(values.get(id).cloned())
    }
}

/// Repository whose next `failures` order writes fail with
/// `StoreError::Unavailable`. Everything else delegates to memory.
pub struct FlakyRepository {
    inner: Arc<MemoryOrderRepository>,
    failures: AtomicU32,
    create_calls: AtomicU32,
}

impl FlakyRepository {
    pub fn new(inner: Arc<MemoryOrderRepository>, failures: u32) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(failures),
            create_calls: AtomicU32::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<MemoryOrderRepository> {
        &self.inner
    }

    /// Number of `create_order` calls, failed ones included.
    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl OrderRepository for FlakyRepository {
    async fn voucher(&self, voucher_id: VoucherId) -> StoreResult<Option<SeckillVoucher>> {
        self.inner.voucher(voucher_id).await
    }

    async fn insert_voucher(&self, voucher: &SeckillVoucher) -> StoreResult<bool> {
        self.inner.insert_voucher(voucher).await
    }

    async fn count_orders(&self, user_id: UserId, voucher_id: VoucherId) -> StoreResult<u64> {
        self.inner.count_orders(user_id, voucher_id).await
    }

    async fn create_order(&self, order: &VoucherOrder) -> StoreResult<CreateOutcome> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            return Err(StoreError::Unavailable {
                reason: "injected repository failure".to_string(),
            });
        }
        self.inner.create_order(order).await
    }

    async fn order(&self, order_id: OrderId) -> StoreResult<Option<VoucherOrder>> {
        self.inner.order(order_id).await
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for flash-sale types.

    use super::*;
    use proptest::prelude::*;

    /// Generate a non-zero UserId from a small pool so batches collide.
    pub fn arb_user_id() -> impl Strategy<Value = UserId> {
        (1u64..=20).prop_map(UserId::new)
    }

    pub fn arb_voucher_id() -> impl Strategy<Value = VoucherId> {
        (1u64..=1_000_000).prop_map(VoucherId::new)
    }

    /// Generate a voucher whose sale window is open now.
    pub fn arb_open_voucher() -> impl Strategy<Value = SeckillVoucher> {
        (arb_voucher_id(), 0u32..50)
            .prop_map(|(id, stock)| fixtures::open_voucher(id.get(), stock))
    }

    /// Generate a batch of requesting users, duplicates included.
    pub fn arb_request_batch(max_len: usize) -> impl Strategy<Value = Vec<UserId>> {
        prop::collection::vec(arb_user_id(), 1..=max_len)
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built vouchers and orders.

    use super::*;
    use chrono::Utc;

    /// A voucher on sale from an hour ago until an hour from now.
    pub fn open_voucher(id: u64, stock: u32) -> SeckillVoucher {
        let now = Utc::now();
        SeckillVoucher {
            voucher_id: VoucherId::new(id),
            stock,
            begin_time: now - chrono::Duration::hours(1),
            end_time: now + chrono::Duration::hours(1),
        }
    }

    /// A voucher whose sale starts in an hour.
    pub fn upcoming_voucher(id: u64, stock: u32) -> SeckillVoucher {
        let now = Utc::now();
        SeckillVoucher {
            voucher_id: VoucherId::new(id),
            stock,
            begin_time: now + chrono::Duration::hours(1),
            end_time: now + chrono::Duration::hours(2),
        }
    }

    /// A voucher whose sale ended an hour ago.
    pub fn ended_voucher(id: u64, stock: u32) -> SeckillVoucher {
        let now = Utc::now();
        SeckillVoucher {
            voucher_id: VoucherId::new(id),
            stock,
            begin_time: now - chrono::Duration::hours(2),
            end_time: now - chrono::Duration::hours(1),
        }
    }

    pub fn make_order(order_id: u64, user_id: u64, voucher_id: u64) -> VoucherOrder {
        VoucherOrder {
            order_id: OrderId::new(order_id),
            user_id: UserId::new(user_id),
            voucher_id: VoucherId::new(voucher_id),
            created_at: Utc::now(),
        }
    }

    /// Development configuration with short worker waits.
    pub fn test_config() -> FlashSaleConfig {
        FlashSaleConfig::development()
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over admission results and the error taxonomy.

    use super::*;

    /// Assert admission and return the order id.
    pub fn assert_admitted(result: &FlashSaleResult<Admission>) -> OrderId {
        match result {
            Ok(Admission::Admitted { order_id }) => *order_id,
            other => panic!("Expected Admitted, got {:?}", other),
        }
    }

    pub fn assert_rejected(result: &FlashSaleResult<Admission>, expected: Rejection) {
        match result {
            Ok(Admission::Rejected(rejection)) => assert_eq!(*rejection, expected),
            other => panic!("Expected Rejected({:?}), got {:?}", expected, other),
        }
    }

    pub fn assert_validation_error<T: std::fmt::Debug>(result: &FlashSaleResult<T>) {
        assert!(
            matches!(result, Err(FlashSaleError::Validation(_))),
            "Expected Validation error, got {:?}",
            result
        );
    }

    pub fn assert_transient<T: std::fmt::Debug>(result: &FlashSaleResult<T>) {
        match result {
            Err(e) => assert!(e.is_transient(), "Expected transient error, got {:?}", e),
            Ok(v) => panic!("Expected transient error, got Ok({:?})", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counting_loader_counts_every_call() {
        let loader = CountingLoader::new([(1u64, "a".to_string())]);
        assert_eq!(loader.load(&1).await.unwrap().as_deref(), Some("a"));
        assert_eq!(loader.load(&2).await.unwrap(), None);
        assert_eq!(loader.calls(), 2);
    }

    #[tokio::test]
    async fn test_flaky_repository_recovers() {
        let inner = Arc::new(MemoryOrderRepository::with_vouchers([fixtures::open_voucher(
            1, 1,
        )]));
        let repo = FlakyRepository::new(inner, 1);
        let order = fixtures::make_order(10, 7, 1);
        assert!(repo.create_order(&order).await.is_err());
        assert_eq!(repo.create_order(&order).await.unwrap(), CreateOutcome::Created);
        assert_eq!(repo.create_calls(), 2);
    }

    #[test]
    fn test_voucher_fixtures_windows() {
        let now = chrono::Utc::now();
        assert!(fixtures::open_voucher(1, 1).check_sale_window(now).is_ok());
        assert!(fixtures::upcoming_voucher(1, 1).check_sale_window(now).is_err());
        assert!(fixtures::ended_voucher(1, 1).check_sale_window(now).is_err());
    }
}
