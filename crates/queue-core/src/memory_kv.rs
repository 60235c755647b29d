//! An in-memory [`crate::kv::KvStore`] used by the crate's own tests, and
//! suitable for embedding the queue in a process that does not want to run
//! against a real etcd cluster.
//!
//! Grounded on `MemoryStore`/`MemoryStore::watch` in
//! `examples/other_examples/.../key_value_store.rs.rs`: a single in-process
//! store broadcasting every mutation to however many watchers are currently
//! subscribed, with each watcher filtering for the target it cares about.

use crate::error::{Error, Result};
use crate::kv::{Compare, KvPair, KvServerHandle, KvStore, Txn, TxnOp, TxnResult, WatchEvent, WatchStream, WatchTarget};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const EVENT_CHANNEL_CAPACITY: usize = 4096;

struct Inner {
    data: BTreeMap<String, Vec<u8>>,
    create_revision: HashMap<String, i64>,
    mod_revision: HashMap<String, i64>,
    revision: i64,
    // Every event ever committed, in revision order, so a `watch()` call can
    // replay history from `start_revision` the way a real etcd history does
    // (see `EtcdKv::watch`'s `WatchOptions::with_start_revision`). Unbounded,
    // since this backend only exists for tests and in-process embedding.
    log: Vec<(i64, WatchEvent)>,
    events: broadcast::Sender<(i64, WatchEvent)>,
}

/// An in-memory, single-process stand-in for a strongly-consistent KV store.
pub struct MemoryKv {
    inner: Mutex<Inner>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        MemoryKv {
            inner: Mutex::new(Inner {
                data: BTreeMap::new(),
                create_revision: HashMap::new(),
                mod_revision: HashMap::new(),
                revision: 0,
                log: Vec::new(),
                events,
            }),
        }
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn compare_holds(inner: &Inner, compare: &Compare) -> bool {
        match compare {
            Compare::CreateRevisionEqual { key, revision } => {
                inner.create_revision.get(key).copied().unwrap_or(0) == *revision
            }
            Compare::CreateRevisionGreater { key, revision } => {
                inner.create_revision.get(key).copied().unwrap_or(0) > *revision
            }
        }
    }

    /// Applies `ops` at `revision`, returning the resulting events in order.
    fn apply(inner: &mut Inner, ops: &[TxnOp], revision: i64) -> Vec<WatchEvent> {
        let mut events = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                TxnOp::Put { key, value } => {
                    inner
                        .create_revision
                        .entry(key.clone())
                        .or_insert(revision);
                    inner.mod_revision.insert(key.clone(), revision);
                    inner.data.insert(key.clone(), value.clone());
                    events.push(WatchEvent::Put(KvPair {
                        key: key.clone(),
                        value: value.clone(),
                        mod_revision: revision,
                    }));
                }
                TxnOp::Delete { key } => {
                    if inner.data.remove(key).is_some() {
                        inner.create_revision.remove(key);
                        inner.mod_revision.remove(key);
                        events.push(WatchEvent::Delete {
                            key: key.clone(),
                            mod_revision: revision,
                        });
                    }
                }
            }
        }
        events
    }

    /// Appends `events` (committed at `revision`) to the replayable log and
    /// broadcasts them to whatever watchers are live right now.
    fn record(inner: &mut Inner, revision: i64, events: Vec<WatchEvent>) {
        for event in events {
            inner.log.push((revision, event.clone()));
            let _ = inner.events.send((revision, event));
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        inner.revision += 1;
        let revision = inner.revision;
        let events = Self::apply(&mut inner, &[TxnOp::Put { key: key.to_string(), value }], revision);
        Self::record(&mut inner, revision, events);
        Ok(revision)
    }

    async fn get_range(&self, prefix: &str, limit: Option<i64>) -> Result<(Vec<KvPair>, i64)> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        for (key, value) in inner.data.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(limit) = limit {
                if out.len() as i64 >= limit {
                    break;
                }
            }
            out.push(KvPair {
                key: key.clone(),
                value: value.clone(),
                mod_revision: inner.mod_revision.get(key).copied().unwrap_or(0),
            });
        }
        Ok((out, inner.revision))
    }

    async fn delete_range(&self, prefix: &str) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        let keys: Vec<String> = inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        inner.revision += 1;
        let revision = inner.revision;
        let ops: Vec<TxnOp> = keys.into_iter().map(|key| TxnOp::Delete { key }).collect();
        let events = Self::apply(&mut inner, &ops, revision);
        Self::record(&mut inner, revision, events);
        Ok(revision)
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResult> {
        let mut inner = self.inner.lock().unwrap();
        let holds = txn.compares.iter().all(|c| Self::compare_holds(&inner, c));
        let ops = if holds { &txn.success } else { &txn.failure };

        inner.revision += 1;
        let revision = inner.revision;
        let events = Self::apply(&mut inner, ops, revision);
        Self::record(&mut inner, revision, events);
        Ok(TxnResult { succeeded: holds, revision })
    }

    async fn watch(&self, target: WatchTarget, start_revision: i64) -> Result<WatchStream> {
        // Subscribing and snapshotting the backlog under the same lock means
        // no write can land in the gap between them: a concurrent `put`/`txn`
        // can only proceed once this critical section releases the lock, at
        // which point it is delivered solely via the broadcast receiver, never
        // via the backlog snapshot taken here.
        let (receiver, backlog) = {
            let inner = self.inner.lock().unwrap();
            let receiver = inner.events.subscribe();
            let backlog: Vec<(i64, WatchEvent)> = inner
                .log
                .iter()
                .filter(|(revision, _)| *revision >= start_revision)
                .cloned()
                .collect();
            (receiver, backlog)
        };

        let backlog = futures::stream::iter(
            backlog.into_iter().map(Ok::<(i64, WatchEvent), Error>),
        );
        let live = BroadcastStream::new(receiver).map(|item| {
            item.map_err(|_lagged| {
                Error::KvUnavailable("watch fell behind the in-memory event buffer".to_string())
            })
        });

        let stream = backlog.chain(live).filter_map(move |item| {
            let target = target.clone();
            async move {
                match item {
                    Ok((revision, event)) if revision >= start_revision && target_matches(&target, &event) => {
                        Some(Ok(event))
                    }
                    Ok(_) => None,
                    Err(err) => Some(Err(err)),
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn current_revision(&self) -> Result<i64> {
        Ok(self.inner.lock().unwrap().revision)
    }
}

fn target_matches(target: &WatchTarget, event: &WatchEvent) -> bool {
    let key = match event {
        WatchEvent::Put(pair) => &pair.key,
        WatchEvent::Delete { key, .. } => key,
    };
    match target {
        WatchTarget::Key(want) => key == want,
        WatchTarget::Prefix(prefix) => key.starts_with(prefix.as_str()),
    }
}

/// A `KvServerHandle` for an in-memory store: there is no external process
/// to bootstrap or tear down, so `stop` is a no-op and the single endpoint
/// is a descriptive placeholder rather than a dialable address.
pub struct MemoryServerHandle;

#[async_trait]
impl KvServerHandle for MemoryServerHandle {
    fn client_endpoints(&self) -> Vec<String> {
        vec!["memory://local".to_string()]
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::Compare;

    #[tokio::test]
    async fn put_then_get_range() {
        let kv = MemoryKv::new();
        kv.put("a/1", b"one".to_vec()).await.unwrap();
        kv.put("a/2", b"two".to_vec()).await.unwrap();
        kv.put("b/1", b"other".to_vec()).await.unwrap();

        let (pairs, _rev) = kv.get_range("a/", None).await.unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].key, "a/1");
        assert_eq!(pairs[1].key, "a/2");
    }

    #[tokio::test]
    async fn get_range_respects_limit() {
        let kv = MemoryKv::new();
        kv.put("a/1", b"one".to_vec()).await.unwrap();
        kv.put("a/2", b"two".to_vec()).await.unwrap();

        let (pairs, _rev) = kv.get_range("a/", Some(1)).await.unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].key, "a/1");
    }

    #[tokio::test]
    async fn txn_guard_blocks_success_branch() {
        let kv = MemoryKv::new();
        kv.put("completed/x", b"done".to_vec()).await.unwrap();

        let txn = Txn::new()
            .when(Compare::not_exists("completed/x"))
            .and_then(TxnOp::Put {
                key: "pending/x".to_string(),
                value: b"v".to_vec(),
            });

        let result = kv.txn(txn).await.unwrap();
        assert!(!result.succeeded);

        let (pairs, _) = kv.get_range("pending/", None).await.unwrap();
        assert!(pairs.is_empty());
    }

    #[tokio::test]
    async fn watch_delivers_matching_events_only() {
        let kv = MemoryKv::new();
        let rev = kv.current_revision().await.unwrap();
        let mut stream = kv
            .watch(WatchTarget::Key("a/1".to_string()), rev + 1)
            .await
            .unwrap();

        kv.put("a/2", b"ignored".to_vec()).await.unwrap();
        kv.put("a/1", b"seen".to_vec()).await.unwrap();

        let event = stream.next().await.unwrap().unwrap();
        match event {
            WatchEvent::Put(pair) => assert_eq!(pair.key, "a/1"),
            _ => panic!("expected a put event"),
        }
    }
}
