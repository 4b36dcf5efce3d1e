#![cfg(feature = "redis-tests")]
//! Full pipeline over a real Redis fast store. Requires `FLASHSALE_REDIS_URL`.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flashsale_seckill::FlashSaleRuntime;
use flashsale_storage::{OrderRepository, RedisStore};
use flashsale_test_utils::{
    assertions, fixtures, MemoryOrderRepository, Rejection, UserId, VoucherId,
};

async fn connect() -> Arc<RedisStore> {
    let store = RedisStore::from_env()
        .await
        .expect("Failed to connect to Redis")
        .expect("FLASHSALE_REDIS_URL must be set");
    Arc::new(store)
}

/// Unique voucher id per run so tests can share a server.
fn unique_id() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    (nanos % 1_000_000_000_000) as u64 + 1
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_unit_is_sold_once_across_two_runtimes() {
    let id = unique_id();
    let voucher_id = VoucherId::new(id);
    let mut config = fixtures::test_config();
    config.queue.stream_key = format!("test:{}:stream.orders", id);

    let repo = Arc::new(MemoryOrderRepository::new());
    let first = FlashSaleRuntime::start(config.clone(), connect().await, repo.clone()).unwrap();
    first
        .service()
        .add_seckill_voucher(&fixtures::open_voucher(id, 1))
        .await
        .unwrap();

    // A second process over the same server sees the same counter.
    config.queue.consumer = "c2".to_string();
    let second = FlashSaleRuntime::start(config, connect().await, repo.clone()).unwrap();
    assertions::assert_admitted(&first.service().submit(voucher_id, UserId::new(1)).await);
    assertions::assert_rejected(
        &second.service().submit(voucher_id, UserId::new(2)).await,
        Rejection::SoldOut,
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while repo.orders_for_voucher(voucher_id).unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "order never persisted");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    first.shutdown().await;
    second.shutdown().await;

    assert_eq!(repo.orders_for_voucher(voucher_id).unwrap().len(), 1);
    assert_eq!(repo.voucher(voucher_id).await.unwrap().unwrap().stock, 0);
}
