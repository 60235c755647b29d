//! End-to-end scenarios against the in-memory `KvStore`, exercising `Queue`
//! the way a real caller would: through `enqueue`/`dequeue`/`front`/`watch`
//! alone, never touching `SubscriptionEngine` directly.

mod common;

use queue_core::codec::KeyLayout;
use queue_core::item::Item;
use queue_core::{Error, Queue};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn queue() -> Queue {
    Queue::new(Arc::new(queue_core::memory_kv::MemoryKv::new()), KeyLayout::default())
}

#[tokio::test]
async fn priority_delivery() {
    common::init_tracing();
    let q = queue();
    let layout = KeyLayout::default();

    let mut front_before = q.front(CancellationToken::new(), "test-bucket").await.unwrap();
    assert!(front_before.current().is_none());

    let a = Item::new(&layout, "test-bucket", "test-data", 1000);
    q.enqueue(CancellationToken::new(), a.clone()).await.unwrap();
    let delivered = front_before.next().await.unwrap().unwrap();
    assert_eq!(delivered.key, a.key);

    let b = Item::new(&layout, "test-bucket", "test-data-2", 9000);
    q.enqueue(CancellationToken::new(), b.clone()).await.unwrap();
    let delivered = front_before.next().await.unwrap().unwrap();
    assert_eq!(delivered.key, b.key);

    let front_after = q.front(CancellationToken::new(), "test-bucket").await.unwrap();
    assert_eq!(front_after.current().unwrap().key, b.key);
}

#[tokio::test]
async fn progress_then_completion() {
    common::init_tracing();
    let q = queue();
    let layout = KeyLayout::default();

    let mut front = q.front(CancellationToken::new(), "test-bucket").await.unwrap();
    let a = Item::new(&layout, "test-bucket", "test-data", 1000);
    q.enqueue(CancellationToken::new(), a.clone()).await.unwrap();
    front.next().await.unwrap();

    let b = Item::new(&layout, "test-bucket", "test-data-2", 9000);
    let mut b_sub = q.enqueue(CancellationToken::new(), b.clone()).await.unwrap();
    front.next().await.unwrap(); // head moves to B

    let mut updated_b = b.clone();
    updated_b.progress = 100;
    updated_b.value = "new-data".to_string();
    q.enqueue(CancellationToken::new(), updated_b.clone()).await.unwrap();

    let delivered = b_sub.next().await.unwrap().expect("terminal delivery");
    assert!(delivered.eq_ignoring_created_at_precision(&updated_b));
    assert!(b_sub.next().await.unwrap().is_none());

    let completed_key = layout.completed_key(&b.key).unwrap();
    let (pairs, _) = q.client().get_range(&completed_key, None).await.unwrap();
    let stored: Item = serde_json::from_slice(&pairs[0].value).unwrap();
    assert!(stored.eq_ignoring_created_at_precision(&updated_b));

    let delivered = front.next().await.unwrap().unwrap();
    assert_eq!(delivered.key, a.key);
}

#[tokio::test]
async fn cancel() {
    common::init_tracing();
    let q = queue();
    let layout = KeyLayout::default();
    let a = Item::new(&layout, "test-bucket", "test-data", 1000);

    let mut a_sub = q.enqueue(CancellationToken::new(), a.clone()).await.unwrap();
    q.dequeue(CancellationToken::new(), &a).await.unwrap();

    let delivered = a_sub.next().await.unwrap().expect("terminal delivery");
    assert!(delivered.canceled);
    assert_eq!(delivered.error, "");
    assert!(a_sub.next().await.unwrap().is_none());
}

#[tokio::test]
async fn mid_life_observer() {
    common::init_tracing();
    let q = queue();
    let layout = KeyLayout::default();
    let a = Item::new(&layout, "test-bucket", "test-data", 5000);
    q.enqueue(CancellationToken::new(), a.clone()).await.unwrap();

    let watch_ctx = CancellationToken::new();
    let mut observer = q.watch(watch_ctx.clone(), &a.key).await.unwrap();

    let mut updated_a = a.clone();
    updated_a.progress = 50;
    updated_a.value = "new-data".to_string();
    q.enqueue(CancellationToken::new(), updated_a.clone()).await.unwrap();

    let delivered = observer.next().await.unwrap().expect("progress update");
    assert!(delivered.eq_ignoring_created_at_precision(&updated_a));

    watch_ctx.cancel();
    assert!(observer.next().await.unwrap().is_none());
}

#[tokio::test]
async fn undecodable_watch_value_is_skipped_not_fatal() {
    common::init_tracing();
    let q = queue();
    let layout = KeyLayout::default();
    let a = Item::new(&layout, "test-bucket", "test-data", 1000);
    q.enqueue(CancellationToken::new(), a.clone()).await.unwrap();

    let mut observer = q.watch(CancellationToken::new(), &a.key).await.unwrap();

    // A corrupted record on the wire: the right key, a value that won't decode.
    q.client().put(&a.key, b"not valid json".to_vec()).await.unwrap();

    let mut updated_a = a.clone();
    updated_a.progress = 50;
    updated_a.value = "new-data".to_string();
    q.enqueue(CancellationToken::new(), updated_a.clone()).await.unwrap();

    // The corrupted event is dropped, not forwarded and not fatal to the
    // subscription: the next delivery is the following valid update.
    let delivered = observer.next().await.unwrap().expect("progress update");
    assert!(delivered.eq_ignoring_created_at_precision(&updated_a));
}

#[tokio::test]
async fn equality_tolerance() {
    common::init_tracing();
    let layout = KeyLayout::default();
    let item = Item::new(&layout, "test-bucket", "test-data", 10);
    let encoded = serde_json::to_vec(&item).unwrap();
    let decoded: Item = serde_json::from_slice(&encoded).unwrap();
    assert!(item.eq_ignoring_created_at_precision(&decoded));
}

#[tokio::test]
async fn terminal_violation() {
    common::init_tracing();
    let q = queue();
    let layout = KeyLayout::default();
    let mut a = Item::new(&layout, "test-bucket", "test-data", 1000);
    a.progress = 100;

    q.enqueue(CancellationToken::new(), a.clone()).await.unwrap();
    let err = q.enqueue(CancellationToken::new(), a.clone()).await.unwrap_err();
    assert!(matches!(err, Error::TerminalStateViolation(key) if key == a.key));

    let completed_key = layout.completed_key(&a.key).unwrap();
    let (pairs, _) = q.client().get_range(&completed_key, None).await.unwrap();
    assert_eq!(pairs.len(), 1);
}
