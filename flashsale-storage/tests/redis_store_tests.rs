#![cfg(feature = "redis-tests")]
//! Redis fast-store tests. Require a reachable server at `FLASHSALE_REDIS_URL`.
//!
//! Every test works under its own key namespace so runs can share a server.

use std::sync::Arc;
use std::time::Duration;

use flashsale_core::{OrderId, QueueFields, ReadOffset, StoreError, UserId, VoucherId};
use flashsale_storage::{
    AdmissionArgs, AdmissionKeys, DistributedLock, KvStore, RedisStore, ScriptStore, StreamStore,
    CODE_ADMITTED, CODE_DUPLICATE, CODE_SOLD_OUT,
};
use uuid::Uuid;

async fn test_store() -> RedisStore {
    RedisStore::from_env()
        .await
        .expect("Failed to connect to Redis")
        .expect("FLASHSALE_REDIS_URL must be set")
}

fn namespace() -> String {
    format!("test:{}:", Uuid::new_v4())
}

fn admission(user: u64, order: u64) -> AdmissionArgs {
    AdmissionArgs {
        voucher_id: VoucherId::new(1),
        user_id: UserId::new(user),
        order_id: OrderId::new(order),
    }
}

#[tokio::test]
async fn conditional_writes_and_counters() {
    let store = test_store().await;
    let ns = namespace();
    let key = format!("{}lock", ns);

    assert!(store
        .set_if_absent(&key, "a", Some(Duration::from_secs(5)))
        .await
        .unwrap());
    assert!(!store
        .set_if_absent(&key, "b", Some(Duration::from_secs(5)))
        .await
        .unwrap());
    assert!(!store.delete_if_equals(&key, "b").await.unwrap());
    assert!(store.delete_if_equals(&key, "a").await.unwrap());
    assert_eq!(store.get(&key).await.unwrap(), None);

    let counter = format!("{}icr", ns);
    assert_eq!(store.incr(&counter).await.unwrap(), 1);
    assert_eq!(store.incr(&counter).await.unwrap(), 2);
    assert!(store.delete(&counter).await.unwrap());
}

#[tokio::test]
async fn ttl_expires_keys() {
    let store = test_store().await;
    let key = format!("{}ttl", namespace());
    store
        .set(&key, "v", Some(Duration::from_millis(50)))
        .await
        .unwrap();
    assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("v"));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.get(&key).await.unwrap(), None);
}

#[tokio::test]
async fn admission_script_decrements_dedups_and_queues() {
    let store = test_store().await;
    let ns = namespace();
    let stream = format!("{}stream.orders", ns);
    let keys = AdmissionKeys {
        stock_key: format!("{}seckill:stock:1", ns),
        order_set_key: format!("{}seckill:order:1", ns),
        stream_key: stream.clone(),
    };

    assert_eq!(store.eval_admission(&keys, &admission(7, 100)).await.unwrap(), CODE_SOLD_OUT);

    store.set(&keys.stock_key, "1", None).await.unwrap();
    store.create_group(&stream, "g1").await.unwrap();
    assert_eq!(store.eval_admission(&keys, &admission(7, 100)).await.unwrap(), CODE_ADMITTED);
    assert_eq!(store.get(&keys.stock_key).await.unwrap().as_deref(), Some("0"));
    assert_eq!(store.eval_admission(&keys, &admission(8, 101)).await.unwrap(), CODE_SOLD_OUT);

    store.set(&keys.stock_key, "5", None).await.unwrap();
    assert_eq!(store.eval_admission(&keys, &admission(7, 102)).await.unwrap(), CODE_DUPLICATE);

    let entry = store
        .read_group(&stream, "g1", "c1", ReadOffset::NextUndelivered, Duration::ZERO)
        .await
        .unwrap()
        .expect("admitted order is queued");
    assert_eq!(entry.fields["userId"], "7");
    assert_eq!(entry.fields["voucherId"], "1");
    assert_eq!(entry.fields["id"], "100");
    assert_eq!(entry.delivery_count, 1);
}

#[tokio::test]
async fn pending_entries_are_redelivered_until_acked() {
    let store = test_store().await;
    let stream = format!("{}stream.orders", namespace());
    store.create_group(&stream, "g1").await.unwrap();
    // Creating the group twice is fine.
    store.create_group(&stream, "g1").await.unwrap();

    let mut fields = QueueFields::new();
    fields.insert("id".to_string(), "1".to_string());
    let id = store.append(&stream, &fields).await.unwrap();

    let first = store
        .read_group(&stream, "g1", "c1", ReadOffset::NextUndelivered, Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.id, id);
    assert_eq!(store.pending_count(&stream, "g1").await.unwrap(), 1);

    let replay = store
        .read_group(&stream, "g1", "c1", ReadOffset::Pending, Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replay.id, id);
    assert_eq!(replay.delivery_count, 2);

    assert!(store.ack(&stream, "g1", id).await.unwrap());
    assert!(!store.ack(&stream, "g1", id).await.unwrap());
    assert_eq!(store.pending_count(&stream, "g1").await.unwrap(), 0);
    assert!(store
        .read_group(&stream, "g1", "c1", ReadOffset::Pending, Duration::ZERO)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn blocking_read_times_out_empty() {
    let store = test_store().await;
    let stream = format!("{}stream.orders", namespace());
    store.create_group(&stream, "g1").await.unwrap();

    let started = tokio::time::Instant::now();
    let read = store
        .read_group(&stream, "g1", "c1", ReadOffset::NextUndelivered, Duration::from_millis(100))
        .await
        .unwrap();
    assert!(read.is_none());
    assert!(started.elapsed() >= Duration::from_millis(90));
}

#[tokio::test]
async fn read_without_group_is_no_such_group() {
    let store = test_store().await;
    let stream = format!("{}stream.orders", namespace());
    let err = store
        .read_group(&stream, "g1", "c1", ReadOffset::Pending, Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NoSuchGroup { .. }));
}

#[tokio::test]
async fn locks_are_shared_between_processes() {
    let first = Arc::new(test_store().await);
    let second = Arc::new(test_store().await);
    let key = format!("{}lock:order:7", namespace());

    let a = DistributedLock::new(first as Arc<dyn KvStore>);
    let b = DistributedLock::new(second as Arc<dyn KvStore>);
    let held = a
        .try_acquire(&key, Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert!(b.try_acquire(&key, Duration::from_secs(5)).await.unwrap().is_none());
    assert!(a.release(held).await.unwrap());
    assert!(b.try_acquire(&key, Duration::from_secs(5)).await.unwrap().is_some());
}
