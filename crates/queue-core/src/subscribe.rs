//! Delivers change notifications for a single item or a bucket's head to
//! however many callers are watching it (§4.D).
//!
//! Grounded on `TaskStateListener`/`TaskManager::get_listener` in
//! `examples/estuary-flow/crates/dekaf/src/task_manager.rs`: a
//! `tokio::sync::watch` channel per watched thing, fed by one background task,
//! read by `borrow_and_update`/`changed` on the subscriber side. `watch`'s
//! "new value overwrites an unread old one" behavior is exactly the delivery
//! semantics §4.D asks for, so no separate buffering is needed.
//!
//! Subscription handles hold only an id and a target, never a reference back
//! into the engine, so dropping a handle never has to walk or lock a shared
//! map synchronously; deregistration instead races the handle's cancellation
//! against the fan-out task, mirroring `TaskManager`'s weak-reference teardown.

use crate::error::Result;
use crate::item::Item;
use crate::kv::{KvStore, WatchEvent};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// What a caller may subscribe to: a single item's pending key, or a
/// bucket's current head (the item that would be dequeued next).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchTarget {
    Item(String),
    Bucket(String),
}

/// A live subscription. Dropping it stops delivery and lets the engine
/// retire the target's fan-out task once no subscribers remain.
#[derive(Debug)]
pub struct Subscription {
    receiver: watch::Receiver<Option<Item>>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Waits for the next delivery. Returns `Ok(None)` once the channel has
    /// closed (terminal event delivered and forwarding stopped, the
    /// subscription's own cancellation fired, or the engine is stopping);
    /// never replays a value already observed.
    pub async fn next(&mut self) -> Result<Option<Item>> {
        if self.receiver.changed().await.is_err() {
            return Ok(None);
        }
        Ok(self.receiver.borrow_and_update().clone())
    }

    /// The most recently delivered value without waiting for a new one.
    pub fn current(&self) -> Option<Item> {
        self.receiver.borrow().clone()
    }

    /// This subscription's own cancellation token, for binding its
    /// lifetime to a caller-supplied `ctx` without consuming the handle.
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// An independent receiver over the same channel, used only to detect
    /// that the subscription has closed on its own (so a task watching for
    /// external cancellation can stop waiting instead of outliving it).
    pub(crate) fn closed_signal(&self) -> watch::Receiver<Option<Item>> {
        self.receiver.clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct TargetEntry {
    task: tokio::task::JoinHandle<()>,
    senders: Arc<Mutex<HashMap<u64, watch::Sender<Option<Item>>>>>,
    target_cancel: CancellationToken,
}

/// Fans out KV watch events for every distinct [`WatchTarget`] currently
/// being observed, to however many [`Subscription`]s are registered on it.
pub struct SubscriptionEngine {
    kv: Arc<dyn KvStore>,
    layout: crate::codec::KeyLayout,
    targets: Mutex<HashMap<WatchTarget, TargetEntry>>,
    next_id: AtomicU64,
    root_cancel: CancellationToken,
}

impl SubscriptionEngine {
    pub fn new(kv: Arc<dyn KvStore>, layout: crate::codec::KeyLayout, root_cancel: CancellationToken) -> Self {
        SubscriptionEngine {
            kv,
            layout,
            targets: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            root_cancel,
        }
    }

    /// Subscribes to `target`, starting its fan-out task if this is the
    /// first subscriber.
    pub async fn subscribe(self: &Arc<Self>, target: WatchTarget) -> Result<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (initial, revision) = self.scan(&target).await?;
        let (tx, rx) = watch::channel(initial);

        let mut targets = self.targets.lock().unwrap();
        let entry = match targets.get(&target) {
            Some(entry) => entry,
            None => {
                let target_cancel = self.root_cancel.child_token();
                let senders = Arc::new(Mutex::new(HashMap::new()));
                // Start the watch at the exact revision this scan was
                // consistent at, so no write between the scan and the
                // watch's registration is missed or double-delivered.
                let task = tokio::spawn(Self::run_fan_out(
                    Arc::clone(&self.kv),
                    self.layout.clone(),
                    target.clone(),
                    Arc::clone(&senders),
                    target_cancel.clone(),
                    revision + 1,
                ));
                targets.insert(
                    target.clone(),
                    TargetEntry {
                        task,
                        senders,
                        target_cancel,
                    },
                );
                targets.get(&target).unwrap()
            }
        };
        entry.senders.lock().unwrap().insert(id, tx);

        let subscription_cancel = entry.target_cancel.child_token();
        self.spawn_deregister(target, id, subscription_cancel.clone());

        Ok(Subscription {
            receiver: rx,
            cancel: subscription_cancel,
        })
    }

    /// Subscribes to every update of an item (used by `Watch`): every
    /// decoded update to either its pending or completed record, closing
    /// once the item reaches a completed state or `shutdown` fires.
    pub async fn subscribe_item_watch(self: &Arc<Self>, pending_key: String) -> Result<Subscription> {
        let mut raw = self.subscribe(WatchTarget::Item(pending_key)).await?;
        let initial = raw.current();
        let already_terminal = initial.as_ref().map(|item| item.is_completed()).unwrap_or(false);
        let (tx, rx) = watch::channel(None);
        let shutdown = CancellationToken::new();
        let shutdown_child = shutdown.clone();

        tokio::spawn(async move {
            if already_terminal {
                // `watch::channel`'s seed value is never observed as a
                // change by `changed()`; an explicit send is required so
                // the caller's first `next()` actually sees it.
                let _ = tx.send(initial);
                return;
            }
            loop {
                tokio::select! {
                    _ = shutdown_child.cancelled() => break,
                    next = raw.next() => match next {
                        Ok(Some(item)) => {
                            let is_done = item.is_completed();
                            let _ = tx.send(Some(item));
                            if is_done {
                                break;
                            }
                        }
                        Ok(None) | Err(_) => break,
                    },
                }
            }
        });

        Ok(Subscription {
            receiver: rx,
            cancel: shutdown,
        })
    }

    /// Subscribes to a bucket's rolling head (used by `Front`).
    pub async fn subscribe_bucket(self: &Arc<Self>, bucket: String) -> Result<Subscription> {
        self.subscribe(WatchTarget::Bucket(bucket)).await
    }

    /// Subscribes to a single item's terminal transition only (used by
    /// `Enqueue`): delivers at most one event — the item's completed state
    /// — and closes immediately after, suppressing any in-progress updates
    /// in between. If the item is already completed, the first value is
    /// that completed state and the channel closes without the forwarder
    /// task observing any further events.
    pub async fn subscribe_item_terminal_only(self: &Arc<Self>, pending_key: String) -> Result<Subscription> {
        let mut raw = self.subscribe(WatchTarget::Item(pending_key)).await?;
        let initial = raw.current();
        let already_terminal = initial.as_ref().map(|item| item.is_completed()).unwrap_or(false);
        let (tx, rx) = watch::channel(None);
        let shutdown = CancellationToken::new();
        let shutdown_child = shutdown.clone();

        tokio::spawn(async move {
            if already_terminal {
                let _ = tx.send(initial);
                return;
            }
            loop {
                tokio::select! {
                    _ = shutdown_child.cancelled() => break,
                    next = raw.next() => match next {
                        Ok(Some(item)) if item.is_completed() => {
                            let _ = tx.send(Some(item));
                            break;
                        }
                        Ok(Some(_)) => continue,
                        Ok(None) | Err(_) => break,
                    },
                }
            }
        });

        Ok(Subscription {
            receiver: rx,
            cancel: shutdown,
        })
    }

    /// Reads the target's current value together with the revision the
    /// read was consistent at, so a freshly-spawned fan-out task can start
    /// its watch exactly where this scan left off.
    async fn scan(&self, target: &WatchTarget) -> Result<(Option<Item>, i64)> {
        match target {
            WatchTarget::Item(pending_key) => fetch_item(&self.kv, &self.layout, pending_key).await,
            WatchTarget::Bucket(bucket) => fetch_bucket_head(&self.kv, &self.layout, bucket).await,
        }
    }

    /// Races the subscription's own cancellation against the engine
    /// shutting the whole target down, and removes this subscriber's sender
    /// from the fan-out map either way. Never touches the subscription
    /// handle itself: the handle only ever knows its id.
    fn spawn_deregister(self: &Arc<Self>, target: WatchTarget, id: u64, cancel: CancellationToken) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            cancel.cancelled().await;
            let mut targets = engine.targets.lock().unwrap();
            if let Some(entry) = targets.get(&target) {
                let mut senders = entry.senders.lock().unwrap();
                senders.remove(&id);
                if senders.is_empty() {
                    drop(senders);
                    let entry = targets.remove(&target).unwrap();
                    entry.target_cancel.cancel();
                    entry.task.abort();
                }
            }
        });
    }

    /// Tears down every fan-out task. Outstanding [`Subscription`]s observe
    /// this as their receiver closing (`next` returns `Ok(None)`).
    pub fn stop(&self) {
        self.root_cancel.cancel();
        let mut targets = self.targets.lock().unwrap();
        for (_, entry) in targets.drain() {
            entry.task.abort();
        }
    }

    /// Runs a target's fan-out task. An item target watches both its pending
    /// key and its derived completed key — merged, per the design note on
    /// the item codec: a logical item's lifecycle spans both prefixes, and a
    /// subscriber must see the item's content (including `canceled`/`error`)
    /// on the transition, not merely a deletion of its pending record.
    async fn run_fan_out(
        kv: Arc<dyn KvStore>,
        layout: crate::codec::KeyLayout,
        target: WatchTarget,
        senders: Arc<Mutex<HashMap<u64, watch::Sender<Option<Item>>>>>,
        cancel: CancellationToken,
        start_revision: i64,
    ) {
        let mut events = match &target {
            WatchTarget::Item(pending_key) => {
                let completed_key = match layout.completed_key(pending_key) {
                    Ok(key) => key,
                    Err(_) => return,
                };
                let pending_stream = match kv.watch(crate::kv::WatchTarget::Key(pending_key.clone()), start_revision).await {
                    Ok(stream) => stream,
                    Err(_) => return,
                };
                let completed_stream = match kv.watch(crate::kv::WatchTarget::Key(completed_key), start_revision).await {
                    Ok(stream) => stream,
                    Err(_) => return,
                };
                futures::stream::select(pending_stream, completed_stream).boxed()
            }
            WatchTarget::Bucket(bucket) => {
                match kv.watch(crate::kv::WatchTarget::Prefix(layout.bucket_prefix(bucket)), start_revision).await {
                    Ok(stream) => stream,
                    Err(_) => return,
                }
            }
        };

        // Tracks the last bucket head actually delivered, so a pending-record
        // write that doesn't change who's at the front of the bucket (§4.C
        // Front steps 3-4) doesn't produce a spurious duplicate delivery.
        let mut last_bucket_head: Option<Item> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.next() => {
                    let Some(event) = event else { return };
                    let Ok(event) = event else { continue };

                    let value = match &target {
                        WatchTarget::Item(_) => item_from_put_event(&event),
                        WatchTarget::Bucket(bucket) => {
                            let head = fetch_bucket_head(&kv, &layout, bucket).await.ok().and_then(|(item, _)| item);
                            if head == last_bucket_head {
                                continue;
                            }
                            last_bucket_head = head.clone();
                            head
                        }
                    };

                    let Some(value) = value else { continue };
                    let senders = senders.lock().unwrap();
                    for sender in senders.values() {
                        let _ = sender.send(Some(value.clone()));
                    }
                }
            }
        }
    }
}

/// Item-scoped watch events only ever carry new content on `Put` (both the
/// pending and completed keys are only ever put-then-possibly-deleted, never
/// put with an empty value); the matching `Delete` of the pending key that
/// accompanies a transition to completed is a redundant signal, since the
/// completed key's `Put` in the same transaction already carries the item's
/// full post-transition state.
fn item_from_put_event(event: &WatchEvent) -> Option<Item> {
    match event {
        WatchEvent::Put(pair) => match serde_json::from_slice(&pair.value) {
            Ok(item) => Some(item),
            Err(err) => {
                tracing::warn!(key = %pair.key, error = %err, "dropping watch event with undecodable value");
                None
            }
        },
        WatchEvent::Delete { .. } => None,
    }
}

async fn fetch_item(
    kv: &Arc<dyn KvStore>,
    layout: &crate::codec::KeyLayout,
    pending_key: &str,
) -> Result<(Option<Item>, i64)> {
    let (pairs, revision) = kv.get_range(pending_key, Some(1)).await?;
    if let Some(pair) = pairs.into_iter().find(|p| p.key == pending_key) {
        return Ok((Some(serde_json::from_slice(&pair.value)?), revision));
    }

    let completed_key = layout.completed_key(pending_key)?;
    let (pairs, revision) = kv.get_range(&completed_key, Some(1)).await?;
    match pairs.into_iter().find(|p| p.key == completed_key) {
        Some(pair) => Ok((Some(serde_json::from_slice(&pair.value)?), revision)),
        None => Ok((None, revision)),
    }
}

async fn fetch_bucket_head(
    kv: &Arc<dyn KvStore>,
    layout: &crate::codec::KeyLayout,
    bucket: &str,
) -> Result<(Option<Item>, i64)> {
    let prefix = layout.bucket_prefix(bucket);
    let (pairs, revision) = kv.get_range(&prefix, Some(1)).await?;
    match pairs.into_iter().next() {
        Some(pair) => Ok((Some(serde_json::from_slice(&pair.value)?), revision)),
        None => Ok((None, revision)),
    }
}
