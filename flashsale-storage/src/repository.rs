//! Durable order store.
//!
//! The repository owns vouchers with their authoritative stock and the
//! persisted orders. `create_order` is the only write path for orders and it
//! runs the duplicate check, the conditional stock decrement and the insert as
//! one unit.

use async_trait::async_trait;
use flashsale_core::{
    OrderId, SeckillVoucher, StoreError, StoreResult, UserId, VoucherId, VoucherOrder,
};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Mutex;

/// Result of a fulfillment write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Stock decremented and order inserted.
    Created,
    /// An order for this (user, voucher) already exists. Nothing changed.
    AlreadyExists,
    /// Conditional decrement affected no row. Nothing changed.
    StockExhausted,
}

/// Durable store for vouchers and orders.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Load a voucher with its current durable stock.
    async fn voucher(&self, voucher_id: VoucherId) -> StoreResult<Option<SeckillVoucher>>;

    /// Insert a new voucher. Returns `false` without touching the stored row
    /// when a voucher with the same id already exists.
    async fn insert_voucher(&self, voucher: &SeckillVoucher) -> StoreResult<bool>;

    /// Count persisted orders for (user, voucher).
    async fn count_orders(&self, user_id: UserId, voucher_id: VoucherId) -> StoreResult<u64>;

    /// Atomically re-check for an existing order, decrement stock where
    /// `stock > 0`, and insert the order.
    async fn create_order(&self, order: &VoucherOrder) -> StoreResult<CreateOutcome>;

    /// Look up an order by id.
    async fn order(&self, order_id: OrderId) -> StoreResult<Option<VoucherOrder>>;
}

#[derive(Debug, Default)]
struct RepositoryState {
    vouchers: HashMap<VoucherId, SeckillVoucher>,
    orders: HashMap<OrderId, VoucherOrder>,
}

/// In-memory repository for tests and single-process use.
#[derive(Debug, Default)]
pub struct MemoryOrderRepository {
    state: Mutex<RepositoryState>,
}

impl MemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a repository seeded with vouchers.
    pub fn with_vouchers(vouchers: impl IntoIterator<Item = SeckillVoucher>) -> Self {
        let repo = Self::new();
        if let Ok(mut state) = repo.state.lock() {
            for voucher in vouchers {
                state.vouchers.insert(voucher.voucher_id, voucher);
            }
        }
        repo
    }

    /// All persisted orders for a voucher, ordered by order id.
    pub fn orders_for_voucher(&self, voucher_id: VoucherId) -> StoreResult<Vec<VoucherOrder>> {
        let state = self.state.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut orders: Vec<VoucherOrder> = state
            .orders
            .values()
            .filter(|o| o.voucher_id == voucher_id)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.order_id);
        Ok(orders)
    }
}

#[async_trait]
impl OrderRepository for MemoryOrderRepository {
    async fn voucher(&self, voucher_id: VoucherId) -> StoreResult<Option<SeckillVoucher>> {
        let state = self.state.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(state.vouchers.get(&voucher_id).cloned())
    }

    async fn insert_voucher(&self, voucher: &SeckillVoucher) -> StoreResult<bool> {
        let mut state = self.state.lock().map_err(|_| StoreError::LockPoisoned)?;
        match state.vouchers.entry(voucher.voucher_id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(voucher.clone());
                Ok(true)
            }
        }
    }

    async fn count_orders(&self, user_id: UserId, voucher_id: VoucherId) -> StoreResult<u64> {
        let state = self.state.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(state
            .orders
            .values()
            .filter(|o| o.user_id == user_id && o.voucher_id == voucher_id)
            .count() as u64)
    }

    async fn create_order(&self, order: &VoucherOrder) -> StoreResult<CreateOutcome> {
        let mut state = self.state.lock().map_err(|_| StoreError::LockPoisoned)?;

        let exists = state.orders.contains_key(&order.order_id)
            || state
                .orders
                .values()
                .any(|o| o.user_id == order.user_id && o.voucher_id == order.voucher_id);
        if exists {
            return Ok(CreateOutcome::AlreadyExists);
        }

        match state.vouchers.get_mut(&order.voucher_id) {
            Some(voucher) if voucher.stock > 0 => voucher.stock -= 1,
            _ => return Ok(CreateOutcome::StockExhausted),
        }
        state.orders.insert(order.order_id, order.clone());
        Ok(CreateOutcome::Created)
    }

    async fn order(&self, order_id: OrderId) -> StoreResult<Option<VoucherOrder>> {
        let state = self.state.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(state.orders.get(&order_id).cloned())
    }
}
