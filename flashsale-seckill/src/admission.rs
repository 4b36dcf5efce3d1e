//! Admission: the synchronous request path.
//!
//! `submit` validates the request, checks the sale window through the
//! voucher cache, names the order with the id generator and runs the atomic
//! admission script. Only the script touches fast-store stock and the dedup
//! set; its answer is final and is never retried.

use async_trait::async_trait;
use chrono::Utc;
use flashsale_core::constants::{CACHE_VOUCHER_KEY, ORDER_BIZ_TAG, SECKILL_STOCK_KEY};
use flashsale_core::{
    Admission, FlashSaleResult, OrderId, SeckillVoucher, StoreError, UserId, ValidationError,
    VoucherId,
};
use flashsale_storage::{
    AdmissionArgs, AdmissionKeys, CacheClient, EntityLoader, IdGenerator, KvStore,
    OrderRepository, ScriptStore,
};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// ADMISSION EXECUTOR
// ============================================================================

/// Runs the admission script and maps its return code.
#[derive(Clone)]
pub struct AdmissionExecutor {
    script: Arc<dyn ScriptStore>,
    stream_key: String,
}

impl AdmissionExecutor {
    pub fn new(script: Arc<dyn ScriptStore>, stream_key: impl Into<String>) -> Self {
        Self {
            script,
            stream_key: stream_key.into(),
        }
    }

    /// Admit `user_id` for `voucher_id` under a pre-generated `order_id`.
    pub async fn execute(
        &self,
        voucher_id: VoucherId,
        user_id: UserId,
        order_id: OrderId,
    ) -> FlashSaleResult<Admission> {
        let keys = AdmissionKeys::for_voucher(voucher_id, &self.stream_key);
        let args = AdmissionArgs {
            voucher_id,
            user_id,
            order_id,
        };
        let code = self.script.eval_admission(&keys, &args).await?;
        let admission =
            Admission::from_script_code(code, order_id).ok_or_else(|| StoreError::Protocol {
                operation: "eval_admission".to_string(),
                reason: format!("unexpected script return code {}", code),
            })?;

        match admission {
            Admission::Admitted { order_id } => tracing::debug!(
                %voucher_id,
                %user_id,
                %order_id,
                "order admitted"
            ),
            Admission::Rejected(reason) => tracing::debug!(
                %voucher_id,
                %user_id,
                %reason,
                "order rejected"
            ),
        }
        Ok(admission)
    }
}

// ============================================================================
// VOUCHER LOADER
// ============================================================================

/// Loads vouchers from the durable store on a cache miss.
pub struct VoucherLoader {
    repo: Arc<dyn OrderRepository>,
}

impl VoucherLoader {
    pub fn new(repo: Arc<dyn OrderRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl EntityLoader<VoucherId, SeckillVoucher> for VoucherLoader {
    async fn load(&self, id: &VoucherId) -> FlashSaleResult<Option<SeckillVoucher>> {
        Ok(self.repo.voucher(*id).await?)
    }
}

// ============================================================================
// SECKILL SERVICE
// ============================================================================

/// Entry point for flash-sale order requests.
pub struct SeckillService {
    kv: Arc<dyn KvStore>,
    repo: Arc<dyn OrderRepository>,
    cache: Arc<CacheClient>,
    ids: IdGenerator,
    executor: AdmissionExecutor,
    vouchers: VoucherLoader,
    voucher_ttl: Duration,
}

impl SeckillService {
    pub fn new(
        kv: Arc<dyn KvStore>,
        repo: Arc<dyn OrderRepository>,
        cache: Arc<CacheClient>,
        ids: IdGenerator,
        executor: AdmissionExecutor,
    ) -> Self {
        let voucher_ttl = cache.config().default_ttl;
        Self {
            kv,
            vouchers: VoucherLoader::new(Arc::clone(&repo)),
            repo,
            cache,
            ids,
            executor,
            voucher_ttl,
        }
    }

    /// Submit an order request for `user_id`, who was resolved by the caller.
    ///
    /// Returns `Admitted { order_id }` when the order was accepted and queued
    /// for fulfillment, or `Rejected(SoldOut | Duplicate)`.
    pub async fn submit(
        &self,
        voucher_id: VoucherId,
        user_id: UserId,
    ) -> FlashSaleResult<Admission> {
        if voucher_id.is_zero() {
            return Err(ValidationError::InvalidValue {
                field: "voucher_id".to_string(),
                reason: "must be non-zero".to_string(),
            }
            .into());
        }
        if user_id.is_zero() {
            return Err(ValidationError::InvalidValue {
                field: "user_id".to_string(),
                reason: "must be non-zero".to_string(),
            }
            .into());
        }

        let voucher: SeckillVoucher = self
            .cache
            .query_with_pass_through(
                CACHE_VOUCHER_KEY,
                voucher_id,
                &self.vouchers,
                self.voucher_ttl,
            )
            .await?
            .ok_or(ValidationError::VoucherNotFound { voucher_id })?;
        voucher.check_sale_window(Utc::now())?;

        let order_id = OrderId::new(self.ids.next_id(ORDER_BIZ_TAG).await?);
        self.executor.execute(voucher_id, user_id, order_id).await
    }

    /// Register a flash-sale voucher: persist it and load its stock into the
    /// fast-store counter admission reads.
    ///
    /// Registration is insert-only. A voucher id that is already registered
    /// fails with `VoucherExists` and leaves both stock values untouched.
    pub async fn add_seckill_voucher(&self, voucher: &SeckillVoucher) -> FlashSaleResult<()> {
        if voucher.voucher_id.is_zero() {
            return Err(ValidationError::InvalidValue {
                field: "voucher_id".to_string(),
                reason: "must be non-zero".to_string(),
            }
            .into());
        }
        if voucher.end_time <= voucher.begin_time {
            return Err(ValidationError::InvalidValue {
                field: "end_time".to_string(),
                reason: "must be after begin_time".to_string(),
            }
            .into());
        }

        if !self.repo.insert_voucher(voucher).await? {
            return Err(ValidationError::VoucherExists {
                voucher_id: voucher.voucher_id,
            }
            .into());
        }
        let stock_key = format!("{}{}", SECKILL_STOCK_KEY, voucher.voucher_id);
        if !self
            .kv
            .set_if_absent(&stock_key, &voucher.stock.to_string(), None)
            .await?
        {
            // A live counter outranks the registration; admissions may already
            // have consumed part of it.
            tracing::warn!(
                voucher_id = %voucher.voucher_id,
                stock_key = %stock_key,
                "stock counter already present, keeping it"
            );
        }
        self.cache
            .invalidate(CACHE_VOUCHER_KEY, voucher.voucher_id)
            .await?;

        tracing::info!(
            voucher_id = %voucher.voucher_id,
            stock = voucher.stock,
            begin_time = %voucher.begin_time,
            end_time = %voucher.end_time,
            "seckill voucher registered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flashsale_core::{CacheConfig, IdConfig, Rejection};
    use flashsale_storage::{DistributedLock, MemoryOrderRepository, MemoryStore, RebuildPool};

    struct Fixture {
        store: Arc<MemoryStore>,
        repo: Arc<MemoryOrderRepository>,
        service: SeckillService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let repo = Arc::new(MemoryOrderRepository::new());
        let kv = store.clone() as Arc<dyn KvStore>;
        let config = CacheConfig::default();
        let cache = Arc::new(CacheClient::new(
            kv.clone(),
            DistributedLock::new(kv.clone()),
            Arc::new(RebuildPool::new(config.rebuild_workers)),
            config,
        ));
        let service = SeckillService::new(
            kv.clone(),
            repo.clone(),
            cache,
            IdGenerator::new(kv, &IdConfig::default()),
            AdmissionExecutor::new(store.clone(), "stream.orders"),
        );
        Fixture {
            store,
            repo,
            service,
        }
    }

    fn open_voucher(id: u64, stock: u32) -> SeckillVoucher {
        let now = Utc::now();
        SeckillVoucher {
            voucher_id: VoucherId::new(id),
            stock,
            begin_time: now - chrono::Duration::hours(1),
            end_time: now + chrono::Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn test_register_loads_stock_counter() {
        let f = fixture();
        f.service.add_seckill_voucher(&open_voucher(1, 3)).await.unwrap();
        assert_eq!(
            f.store.get("seckill:stock:1").await.unwrap().as_deref(),
            Some("3")
        );
        assert!(f.repo.voucher(VoucherId::new(1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reregistration_keeps_both_stock_values() {
        let f = fixture();
        f.service.add_seckill_voucher(&open_voucher(1, 1)).await.unwrap();
        assert!(f
            .service
            .submit(VoucherId::new(1), UserId::new(1))
            .await
            .unwrap()
            .is_admitted());

        let err = f
            .service
            .add_seckill_voucher(&open_voucher(1, 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            flashsale_core::FlashSaleError::Validation(ValidationError::VoucherExists { .. })
        ));
        assert_eq!(
            f.store.get("seckill:stock:1").await.unwrap().as_deref(),
            Some("0")
        );
        assert_eq!(
            f.service
                .submit(VoucherId::new(1), UserId::new(2))
                .await
                .unwrap(),
            Admission::Rejected(Rejection::SoldOut)
        );
    }

    #[tokio::test]
    async fn test_existing_counter_is_not_overwritten() {
        let f = fixture();
        f.store.set("seckill:stock:1", "2", None).await.unwrap();
        f.service.add_seckill_voucher(&open_voucher(1, 9)).await.unwrap();
        assert_eq!(
            f.store.get("seckill:stock:1").await.unwrap().as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn test_submit_admits_then_rejects() {
        let f = fixture();
        f.service.add_seckill_voucher(&open_voucher(1, 1)).await.unwrap();

        let first = f
            .service
            .submit(VoucherId::new(1), UserId::new(7))
            .await
            .unwrap();
        let order_id = first.order_id().unwrap();
        assert!(!order_id.is_zero());

        let again = f
            .service
            .submit(VoucherId::new(1), UserId::new(7))
            .await
            .unwrap();
        // Stock is checked before the dedup set.
        assert_eq!(again, Admission::Rejected(Rejection::SoldOut));

        let other = f
            .service
            .submit(VoucherId::new(1), UserId::new(8))
            .await
            .unwrap();
        assert_eq!(other, Admission::Rejected(Rejection::SoldOut));

        let entries = f.store.stream_entries("stream.orders").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.get("id"), Some(&order_id.to_string()));
    }

    #[tokio::test]
    async fn test_duplicate_while_stock_remains() {
        let f = fixture();
        f.service.add_seckill_voucher(&open_voucher(1, 5)).await.unwrap();
        assert!(f
            .service
            .submit(VoucherId::new(1), UserId::new(7))
            .await
            .unwrap()
            .is_admitted());
        assert_eq!(
            f.service
                .submit(VoucherId::new(1), UserId::new(7))
                .await
                .unwrap(),
            Admission::Rejected(Rejection::Duplicate)
        );
        assert_eq!(
            f.store.get("seckill:stock:1").await.unwrap().as_deref(),
            Some("4")
        );
    }

    #[tokio::test]
    async fn test_unknown_voucher_and_closed_window() {
        let f = fixture();
        let err = f
            .service
            .submit(VoucherId::new(99), UserId::new(7))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            flashsale_core::FlashSaleError::Validation(ValidationError::VoucherNotFound { .. })
        ));

        let now = Utc::now();
        let upcoming = SeckillVoucher {
            voucher_id: VoucherId::new(2),
            stock: 1,
            begin_time: now + chrono::Duration::hours(1),
            end_time: now + chrono::Duration::hours(2),
        };
        f.service.add_seckill_voucher(&upcoming).await.unwrap();
        let err = f
            .service
            .submit(VoucherId::new(2), UserId::new(7))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            flashsale_core::FlashSaleError::Validation(ValidationError::SaleNotStarted { .. })
        ));
        assert_eq!(f.store.stream_len("stream.orders").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_registration_clears_negative_cache() {
        let f = fixture();
        assert!(f
            .service
            .submit(VoucherId::new(1), UserId::new(7))
            .await
            .is_err());
        f.service.add_seckill_voucher(&open_voucher(1, 1)).await.unwrap();
        assert!(f
            .service
            .submit(VoucherId::new(1), UserId::new(7))
            .await
            .unwrap()
            .is_admitted());
    }

    #[tokio::test]
    async fn test_zero_ids_rejected_before_store_access() {
        let f = fixture();
        f.store.set_offline(true);
        let err = f
            .service
            .submit(VoucherId::new(0), UserId::new(7))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        let err = f
            .service
            .submit(VoucherId::new(1), UserId::new(0))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_unknown_script_code_is_protocol_error() {
        struct BrokenScript;

        #[async_trait]
        impl ScriptStore for BrokenScript {
            async fn eval_admission(
                &self,
                _keys: &AdmissionKeys,
                _args: &AdmissionArgs,
            ) -> flashsale_core::StoreResult<i64> {
                Ok(7)
            }
        }

        let executor = AdmissionExecutor::new(Arc::new(BrokenScript), "stream.orders");
        let err = executor
            .execute(VoucherId::new(1), UserId::new(1), OrderId::new(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            flashsale_core::FlashSaleError::Store(StoreError::Protocol { .. })
        ));
    }
}
