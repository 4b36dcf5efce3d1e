//! End-to-end scenarios over the in-process stores: admission, queueing,
//! fulfillment and the voucher cache working together.

use std::sync::Arc;
use std::time::Duration;

use flashsale_core::constants::{CACHE_HOT_VOUCHER_KEY, SECKILL_ORDER_KEY, SECKILL_STOCK_KEY};
use flashsale_seckill::FlashSaleRuntime;
use flashsale_storage::{KvStore, OrderRepository};
use flashsale_test_utils::{
    assertions, fixtures, Admission, CountingLoader, FlashSaleError, MemoryOrderRepository,
    MemoryStore, Rejection, SeckillVoucher, UserId, ValidationError, VoucherId,
};

struct Harness {
    store: Arc<MemoryStore>,
    repo: Arc<MemoryOrderRepository>,
    runtime: FlashSaleRuntime,
}

fn start() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let repo = Arc::new(MemoryOrderRepository::new());
    let runtime = FlashSaleRuntime::start(fixtures::test_config(), store.clone(), repo.clone())
        .expect("runtime starts");
    Harness {
        store,
        repo,
        runtime,
    }
}

async fn wait_for_orders(repo: &MemoryOrderRepository, voucher_id: VoucherId, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let orders = repo.orders_for_voucher(voucher_id).unwrap();
        if orders.len() >= expected {
            assert_eq!(orders.len(), expected, "more orders than admissions");
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {} orders, have {}",
            expected,
            orders.len()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_unit_goes_to_exactly_one_of_two_users() {
    let h = start();
    let service = h.runtime.service();
    service
        .add_seckill_voucher(&fixtures::open_voucher(1, 1))
        .await
        .unwrap();

    let first = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.submit(VoucherId::new(1), UserId::new(1)).await }
    });
    let second = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.submit(VoucherId::new(1), UserId::new(2)).await }
    });
    let results = [first.await.unwrap(), second.await.unwrap()];

    let admitted: Vec<_> = results
        .iter()
        .filter(|r| matches!(r, Ok(Admission::Admitted { .. })))
        .collect();
    assert_eq!(admitted.len(), 1);
    let rejected = results
        .iter()
        .find(|r| matches!(r, Ok(Admission::Rejected(_))))
        .expect("one request rejected");
    assertions::assert_rejected(rejected, Rejection::SoldOut);

    wait_for_orders(&h.repo, VoucherId::new(1), 1).await;
    let voucher = h.repo.voucher(VoucherId::new(1)).await.unwrap().unwrap();
    assert_eq!(voucher.stock, 0);
    assert_eq!(
        h.store.get(&format!("{}1", SECKILL_STOCK_KEY)).await.unwrap().as_deref(),
        Some("0")
    );
    assert_eq!(
        h.store.set_members(&format!("{}1", SECKILL_ORDER_KEY)).unwrap().len(),
        1
    );

    let report = h.runtime.shutdown().await;
    assert_eq!(report.worker.created, 1);
}

#[tokio::test]
async fn second_request_from_same_user_is_duplicate() {
    let h = start();
    let service = h.runtime.service();
    service
        .add_seckill_voucher(&fixtures::open_voucher(1, 5))
        .await
        .unwrap();

    let first = service.submit(VoucherId::new(1), UserId::new(7)).await;
    let order_id = assertions::assert_admitted(&first);
    let second = service.submit(VoucherId::new(1), UserId::new(7)).await;
    assertions::assert_rejected(&second, Rejection::Duplicate);

    wait_for_orders(&h.repo, VoucherId::new(1), 1).await;
    let order = h.repo.order(order_id).await.unwrap().unwrap();
    assert_eq!(order.user_id, UserId::new(7));
    assert_eq!(
        h.repo.voucher(VoucherId::new(1)).await.unwrap().unwrap().stock,
        4
    );
    assert_eq!(
        h.store.get(&format!("{}1", SECKILL_STOCK_KEY)).await.unwrap().as_deref(),
        Some("4")
    );

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn sale_window_and_unknown_voucher_are_validation_errors() {
    let h = start();
    let service = h.runtime.service();
    service
        .add_seckill_voucher(&fixtures::upcoming_voucher(2, 5))
        .await
        .unwrap();
    service
        .add_seckill_voucher(&fixtures::ended_voucher(3, 5))
        .await
        .unwrap();

    assertions::assert_validation_error(&service.submit(VoucherId::new(2), UserId::new(1)).await);
    assertions::assert_validation_error(&service.submit(VoucherId::new(3), UserId::new(1)).await);
    assertions::assert_validation_error(&service.submit(VoucherId::new(99), UserId::new(1)).await);

    // Closed windows never reach the admission script.
    assert_eq!(
        h.store.get(&format!("{}2", SECKILL_STOCK_KEY)).await.unwrap().as_deref(),
        Some("5")
    );
    assert_eq!(h.store.stream_len("stream.orders").unwrap(), 0);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn reregistering_a_voucher_cannot_resell_stock() {
    let h = start();
    let service = h.runtime.service();
    service
        .add_seckill_voucher(&fixtures::open_voucher(1, 1))
        .await
        .unwrap();
    assertions::assert_admitted(&service.submit(VoucherId::new(1), UserId::new(1)).await);

    let again = service
        .add_seckill_voucher(&fixtures::open_voucher(1, 1))
        .await;
    assert!(matches!(
        again,
        Err(FlashSaleError::Validation(ValidationError::VoucherExists { .. }))
    ));

    let second = service.submit(VoucherId::new(1), UserId::new(2)).await;
    assertions::assert_rejected(&second, Rejection::SoldOut);

    wait_for_orders(&h.repo, VoucherId::new(1), 1).await;
    let report = h.runtime.shutdown().await;
    assert_eq!(report.worker.created, 1);
    assert_eq!(report.worker.anomalies, 0);
    assert_eq!(h.repo.orders_for_voucher(VoucherId::new(1)).unwrap().len(), 1);
    assert_eq!(
        h.repo.voucher(VoucherId::new(1)).await.unwrap().unwrap().stock,
        0
    );
}

#[tokio::test]
async fn hot_voucher_served_stale_then_refreshed_once() {
    let h = start();
    let service = h.runtime.service();
    let cache = h.runtime.cache();
    let stale = fixtures::open_voucher(5, 10);
    service.add_seckill_voucher(&stale).await.unwrap();
    let hot_key = format!("{}5", CACHE_HOT_VOUCHER_KEY);
    cache
        .set_with_logical_expire(&hot_key, stale.clone(), Duration::ZERO)
        .await
        .unwrap();

    let loader = Arc::new(CountingLoader::new([(VoucherId::new(5), stale.clone())]));
    let fresh = SeckillVoucher { stock: 3, ..stale.clone() };
    loader.put(VoucherId::new(5), fresh.clone());
    let ttl = Duration::from_secs(60);

    let mut read = cache
        .query_with_logical_expire(CACHE_HOT_VOUCHER_KEY, VoucherId::new(5), loader.clone(), ttl)
        .await
        .unwrap()
        .expect("pre-warmed key");
    assert!(read.is_stale());
    assert_eq!(read.value(), &stale);

    let rebuild = read.take_rebuild().expect("stale read schedules a rebuild");
    rebuild.wait().await.unwrap();

    let read = cache
        .query_with_logical_expire(CACHE_HOT_VOUCHER_KEY, VoucherId::new(5), loader.clone(), ttl)
        .await
        .unwrap()
        .expect("rebuilt key");
    assert!(!read.is_stale());
    assert_eq!(read.into_value(), fresh);
    assert_eq!(loader.calls(), 1);

    // The passthrough prefix admission reads never sees an envelope.
    assertions::assert_admitted(&service.submit(VoucherId::new(5), UserId::new(1)).await);
    assert_eq!(cache.stats().corrupt_entries, 0);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn fast_store_outage_is_transient_and_recoverable() {
    let h = start();
    let service = h.runtime.service();
    service
        .add_seckill_voucher(&fixtures::open_voucher(1, 2))
        .await
        .unwrap();

    h.store.set_offline(true);
    assertions::assert_transient(&service.submit(VoucherId::new(1), UserId::new(1)).await);
    h.store.set_offline(false);

    assertions::assert_admitted(&service.submit(VoucherId::new(1), UserId::new(1)).await);
    wait_for_orders(&h.repo, VoucherId::new(1), 1).await;
    h.runtime.shutdown().await;
}
