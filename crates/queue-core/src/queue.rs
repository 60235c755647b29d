//! The public surface: `Enqueue`, `Dequeue`, `Front`, `Watch`, plus the
//! collaborator escape hatches `Client`/`ClientEndpoints` and lifecycle
//! `Stop` (§6).

use crate::codec::KeyLayout;
use crate::error::{Error, Result};
use crate::item::Item;
use crate::kv::{Compare, KvServerHandle, KvStore, Txn, TxnOp};
use crate::subscribe::{Subscription, SubscriptionEngine};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// A durable, priority-ordered job queue over a [`KvStore`] collaborator.
pub struct Queue {
    kv: Arc<dyn KvStore>,
    layout: KeyLayout,
    engine: Arc<SubscriptionEngine>,
    server: Option<Box<dyn KvServerHandle>>,
    root_cancel: CancellationToken,
    stopped: AtomicBool,
}

impl Queue {
    /// Builds a queue over `kv`, with no embedded server handle attached
    /// (`client_endpoints` returns an empty list, `stop` does not shut
    /// anything else down).
    pub fn new(kv: Arc<dyn KvStore>, layout: KeyLayout) -> Self {
        Self::build(kv, layout, None)
    }

    /// Builds a queue over `kv`, additionally owning `server`'s lifecycle:
    /// `stop` tears it down after the engine's fan-out tasks are canceled.
    pub fn with_server(kv: Arc<dyn KvStore>, layout: KeyLayout, server: Box<dyn KvServerHandle>) -> Self {
        Self::build(kv, layout, Some(server))
    }

    fn build(kv: Arc<dyn KvStore>, layout: KeyLayout, server: Option<Box<dyn KvServerHandle>>) -> Self {
        let root_cancel = CancellationToken::new();
        let engine = Arc::new(SubscriptionEngine::new(Arc::clone(&kv), layout.clone(), root_cancel.child_token()));
        Queue {
            kv,
            layout,
            engine,
            server,
            root_cancel,
            stopped: AtomicBool::new(false),
        }
    }

    fn check_not_stopped(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        Ok(())
    }

    /// Atomically materializes `item`'s current state and returns a
    /// subscription that delivers the item's terminal update, then closes
    /// (§4.C Enqueue).
    #[instrument(skip(self, ctx, item), fields(key = %item.key))]
    pub async fn enqueue(&self, ctx: CancellationToken, item: Item) -> Result<Subscription> {
        self.check_not_stopped()?;
        let item = item.clamped();
        let encoded = serde_json::to_vec(&item)?;
        let completed_key = self.layout.completed_key(&item.key)?;

        let txn = if item.is_completed() {
            Txn::new()
                .when(Compare::not_exists(completed_key.clone()))
                .and_then(TxnOp::Delete { key: item.key.clone() })
                .and_then(TxnOp::Put {
                    key: completed_key,
                    value: encoded,
                })
        } else {
            Txn::new().when(Compare::not_exists(completed_key)).and_then(TxnOp::Put {
                key: item.key.clone(),
                value: encoded,
            })
        };

        let result = run_cancellable(&ctx, self.kv.txn(txn)).await?;
        if !result.succeeded {
            return Err(Error::TerminalStateViolation(item.key));
        }

        debug!(revision = result.revision, "item committed");
        self.engine.subscribe_item_terminal_only(item.key).await
    }

    /// Cancels a pending item. A no-op, returning success, if the item is
    /// not currently pending (§4.C Dequeue; §8 "Idempotent cancel").
    #[instrument(skip(self, ctx, item), fields(key = %item.key))]
    pub async fn dequeue(&self, ctx: CancellationToken, item: &Item) -> Result<()> {
        self.check_not_stopped()?;
        let completed_key = self.layout.completed_key(&item.key)?;
        let mut canceled = item.clone();
        canceled.canceled = true;
        let encoded = serde_json::to_vec(&canceled)?;

        let txn = Txn::new()
            .when(Compare::exists(item.key.clone()))
            .and_then(TxnOp::Delete { key: item.key.clone() })
            .and_then(TxnOp::Put {
                key: completed_key,
                value: encoded,
            });

        run_cancellable(&ctx, self.kv.txn(txn)).await?;
        Ok(())
    }

    /// Returns a subscription delivering the current and subsequent heads
    /// of `bucket`'s pending range (§4.C Front). Never closes on its own;
    /// drop the returned handle (or cancel `ctx` and drop it) to stop.
    #[instrument(skip(self, ctx), fields(bucket))]
    pub async fn front(&self, ctx: CancellationToken, bucket: &str) -> Result<Subscription> {
        self.check_not_stopped()?;
        let subscription = self.engine.subscribe_bucket(bucket.to_string()).await?;
        Ok(bind_to_ctx(subscription, ctx))
    }

    /// Returns a subscription delivering every update to the item at
    /// `item_key`, closing on its first terminal state or on `ctx`
    /// cancellation (§4.D Watch). The item must already exist; events
    /// before subscription are not replayed.
    #[instrument(skip(self, ctx))]
    pub async fn watch(&self, ctx: CancellationToken, item_key: &str) -> Result<Subscription> {
        self.check_not_stopped()?;
        let subscription = self.engine.subscribe_item_watch(item_key.to_string()).await?;
        Ok(bind_to_ctx(subscription, ctx))
    }

    /// The underlying KV client, for collaborators that need to address the
    /// store directly (§6 `Client`).
    pub fn client(&self) -> Arc<dyn KvStore> {
        Arc::clone(&self.kv)
    }

    /// The embedded server's dialable endpoints, or empty if this queue was
    /// built with [`Queue::new`] (no server attached).
    pub fn client_endpoints(&self) -> Vec<String> {
        self.server.as_ref().map(|s| s.client_endpoints()).unwrap_or_default()
    }

    /// Tears down the subscription engine and, if present, the embedded
    /// server. Idempotent; operations called after `stop` return
    /// [`Error::Stopped`] (§5 Resource lifecycle).
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.root_cancel.cancel();
        self.engine.stop();
        if let Some(server) = &self.server {
            server.stop().await?;
        }
        Ok(())
    }
}

/// Runs `future` to completion, or returns [`Error::Cancelled`] if `ctx`
/// fires first (§5 Cancellation: "abort any in-flight KV call").
async fn run_cancellable<T>(ctx: &CancellationToken, future: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        result = future => result,
        _ = ctx.cancelled() => Err(Error::Cancelled),
    }
}

/// Ties `subscription`'s lifetime to `ctx`, without disturbing any other
/// subscription on the same target: cancelling `ctx` cancels only this
/// subscription's own token, which the engine already treats as "this one
/// subscriber went away" (§5: "Cancellation of a Front or Watch subscription
/// closes its channel but must not disturb other subscriptions on the same
/// key").
fn bind_to_ctx(subscription: Subscription, ctx: CancellationToken) -> Subscription {
    let cancel = subscription.cancel_token();
    let mut closed_probe = subscription.closed_signal();
    tokio::spawn(async move {
        tokio::select! {
            _ = ctx.cancelled() => cancel.cancel(),
            _ = async { while closed_probe.changed().await.is_ok() {} } => {}
        }
    });
    subscription
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_kv::MemoryKv;

    fn queue() -> Queue {
        Queue::new(Arc::new(MemoryKv::new()), KeyLayout::default())
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_round_trip() {
        let q = queue();
        let item = Item::new(&KeyLayout::default(), "b", "v", 100);
        let key = item.key.clone();

        let mut sub = q.enqueue(CancellationToken::new(), item.clone()).await.unwrap();
        assert!(sub.current().is_none());

        q.dequeue(CancellationToken::new(), &item).await.unwrap();
        let delivered = sub.next().await.unwrap().expect("terminal delivery");
        assert!(delivered.canceled);
        assert_eq!(delivered.key, key);
    }

    #[tokio::test]
    async fn reenqueue_completed_item_is_rejected() {
        let q = queue();
        let layout = KeyLayout::default();
        let mut item = Item::new(&layout, "b", "v", 100);
        item.progress = 100;

        q.enqueue(CancellationToken::new(), item.clone()).await.unwrap();
        let err = q.enqueue(CancellationToken::new(), item).await.unwrap_err();
        assert!(matches!(err, Error::TerminalStateViolation(_)));
    }

    #[tokio::test]
    async fn dequeue_missing_item_is_a_no_op() {
        let q = queue();
        let item = Item::new(&KeyLayout::default(), "b", "v", 1);
        q.dequeue(CancellationToken::new(), &item).await.unwrap();
    }

    #[tokio::test]
    async fn operations_after_stop_are_rejected() {
        let q = queue();
        q.stop().await.unwrap();
        let item = Item::new(&KeyLayout::default(), "b", "v", 1);
        let err = q.enqueue(CancellationToken::new(), item).await.unwrap_err();
        assert!(matches!(err, Error::Stopped));
    }
}
