//! Order fulfillment: turning an admitted queue entry into a durable order.
//!
//! The worker calls an [`OrderFulfiller`] handed to it at construction. The
//! standard implementation serializes attempts per user with a lease lock,
//! re-checks for an existing order and lets the repository run the
//! conditional stock decrement and insert as one transaction.

use async_trait::async_trait;
use flashsale_core::constants::LOCK_ORDER_KEY;
use flashsale_core::{ConsistencyError, FlashSaleResult, LockConfig, VoucherOrder};
use flashsale_storage::{CreateOutcome, DistributedLock, OrderRepository};
use std::sync::Arc;
use std::time::Duration;

/// What happened to one admitted order. Every variant is final: the queue
/// entry is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FulfillmentOutcome {
    /// Order persisted and durable stock decremented.
    Created,
    /// An order for this (user, voucher) already exists.
    AlreadyFulfilled,
    /// Another attempt for this user holds the order lock.
    LockContended,
    /// Durable stock was already zero although admission succeeded.
    StockAnomaly,
}

#[async_trait]
pub trait OrderFulfiller: Send + Sync {
    /// Persist an admitted order. An `Err` leaves the queue entry pending
    /// for replay.
    async fn fulfill(&self, order: &VoucherOrder) -> FlashSaleResult<FulfillmentOutcome>;
}

pub struct VoucherOrderFulfiller {
    repo: Arc<dyn OrderRepository>,
    locks: DistributedLock,
    lock_lease: Duration,
}

impl VoucherOrderFulfiller {
    pub fn new(
        repo: Arc<dyn OrderRepository>,
        locks: DistributedLock,
        config: &LockConfig,
    ) -> Self {
        Self {
            repo,
            locks,
            lock_lease: config.order_lock_lease,
        }
    }

    async fn create_locked(&self, order: &VoucherOrder) -> FlashSaleResult<FulfillmentOutcome> {
        let existing = self
            .repo
            .count_orders(order.user_id, order.voucher_id)
            .await?;
        if existing > 0 {
            tracing::debug!(
                order_id = %order.order_id,
                user_id = %order.user_id,
                voucher_id = %order.voucher_id,
                "order already fulfilled"
            );
            return Ok(FulfillmentOutcome::AlreadyFulfilled);
        }

        match self.repo.create_order(order).await? {
            CreateOutcome::Created => {
                tracing::debug!(
                    order_id = %order.order_id,
                    user_id = %order.user_id,
                    voucher_id = %order.voucher_id,
                    "order created"
                );
                Ok(FulfillmentOutcome::Created)
            }
            CreateOutcome::AlreadyExists => Ok(FulfillmentOutcome::AlreadyFulfilled),
            CreateOutcome::StockExhausted => {
                let anomaly = ConsistencyError::StockNotDecremented {
                    order_id: order.order_id,
                    user_id: order.user_id,
                    voucher_id: order.voucher_id,
                };
                tracing::error!(
                    order_id = %order.order_id,
                    user_id = %order.user_id,
                    voucher_id = %order.voucher_id,
                    error = %anomaly,
                    "consistency anomaly: admitted order found no durable stock"
                );
                Ok(FulfillmentOutcome::StockAnomaly)
            }
        }
    }
}

#[async_trait]
impl OrderFulfiller for VoucherOrderFulfiller {
    async fn fulfill(&self, order: &VoucherOrder) -> FlashSaleResult<FulfillmentOutcome> {
        let lock_key = format!("{}{}", LOCK_ORDER_KEY, order.user_id);
        let Some(lock) = self.locks.try_acquire(&lock_key, self.lock_lease).await? else {
            tracing::warn!(
                order_id = %order.order_id,
                user_id = %order.user_id,
                "order lock contended, abandoning attempt"
            );
            return Ok(FulfillmentOutcome::LockContended);
        };

        let result = self.create_locked(order).await;

        if let Err(e) = self.locks.release(lock).await {
            tracing::warn!(
                user_id = %order.user_id,
                error = %e,
                "failed to release order lock"
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flashsale_core::{OrderId, SeckillVoucher, UserId, VoucherId};
    use flashsale_storage::{KvStore, MemoryOrderRepository, MemoryStore};

    fn voucher(stock: u32) -> SeckillVoucher {
        let now = Utc::now();
        SeckillVoucher {
            voucher_id: VoucherId::new(1),
            stock,
            begin_time: now - chrono::Duration::hours(1),
            end_time: now + chrono::Duration::hours(1),
        }
    }

    fn order(order: u64, user: u64) -> VoucherOrder {
        VoucherOrder {
            order_id: OrderId::new(order),
            user_id: UserId::new(user),
            voucher_id: VoucherId::new(1),
            created_at: Utc::now(),
        }
    }

    fn setup(stock: u32) -> (Arc<MemoryStore>, Arc<MemoryOrderRepository>, VoucherOrderFulfiller) {
        let store = Arc::new(MemoryStore::new());
        let repo = Arc::new(MemoryOrderRepository::with_vouchers([voucher(stock)]));
        let fulfiller = VoucherOrderFulfiller::new(
            repo.clone(),
            DistributedLock::new(store.clone() as Arc<dyn KvStore>),
            &LockConfig::default(),
        );
        (store, repo, fulfiller)
    }

    #[tokio::test]
    async fn test_creates_order_and_releases_lock() {
        let (store, repo, fulfiller) = setup(1);
        let outcome = fulfiller.fulfill(&order(10, 7)).await.unwrap();
        assert_eq!(outcome, FulfillmentOutcome::Created);
        assert!(repo.order(OrderId::new(10)).await.unwrap().is_some());
        assert!(store.get("lock:order:7").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replay_is_already_fulfilled() {
        let (_, repo, fulfiller) = setup(5);
        fulfiller.fulfill(&order(10, 7)).await.unwrap();
        let outcome = fulfiller.fulfill(&order(10, 7)).await.unwrap();
        assert_eq!(outcome, FulfillmentOutcome::AlreadyFulfilled);
        assert_eq!(repo.orders_for_voucher(VoucherId::new(1)).unwrap().len(), 1);
        assert_eq!(repo.voucher(VoucherId::new(1)).await.unwrap().unwrap().stock, 4);
    }

    #[tokio::test]
    async fn test_contended_lock_abandons() {
        let (store, repo, fulfiller) = setup(5);
        store.set("lock:order:7", "other-holder", None).await.unwrap();
        let outcome = fulfiller.fulfill(&order(10, 7)).await.unwrap();
        assert_eq!(outcome, FulfillmentOutcome::LockContended);
        assert!(repo.order(OrderId::new(10)).await.unwrap().is_none());
        assert_eq!(
            store.get("lock:order:7").await.unwrap().as_deref(),
            Some("other-holder")
        );
    }

    #[tokio::test]
    async fn test_missing_durable_stock_is_an_anomaly() {
        let (_, repo, fulfiller) = setup(0);
        let outcome = fulfiller.fulfill(&order(10, 7)).await.unwrap();
        assert_eq!(outcome, FulfillmentOutcome::StockAnomaly);
        assert!(repo.order(OrderId::new(10)).await.unwrap().is_none());
        assert_eq!(repo.voucher(VoucherId::new(1)).await.unwrap().unwrap().stock, 0);
    }

    #[tokio::test]
    async fn test_store_outage_is_retryable_error() {
        let (store, _, fulfiller) = setup(1);
        store.set_offline(true);
        let err = fulfiller.fulfill(&order(10, 7)).await.unwrap_err();
        assert!(err.is_transient());
    }
}
