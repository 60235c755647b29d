//! [`EtcdKv`] implements `queue_core::kv::KvStore` directly against
//! `etcd_client::Client`, one method per trait method, with no behavior of
//! its own beyond translating between the core's `Compare`/`TxnOp`/`WatchEvent`
//! vocabulary and etcd's wire types.
//!
//! Grounded on the same `#[async_trait] impl KvStore`/`impl KeyValueBucket`
//! split in `examples/other_examples/.../key_value_store.rs.rs`'s `EtcdStore`:
//! a thin backend behind the generic trait, owning nothing but a client handle.

use crate::error::Error;
use async_trait::async_trait;
use etcd_client::{
    Client, Compare as EtcdCompare, CompareOp, DeleteOptions, GetOptions, TxnOp as EtcdTxnOp,
    WatchOptions,
};
use futures::{StreamExt, TryStreamExt};
use queue_core::kv::{Compare, KvPair, KvStore, Txn, TxnOp, TxnResult, WatchEvent, WatchStream, WatchTarget};
use queue_core::{Error as CoreError, Result};

/// A `KvStore` backed by a real etcd cluster.
pub struct EtcdKv {
    client: Client,
}

impl EtcdKv {
    /// Connects to `endpoints`, the dialable client addresses etcd exposes
    /// (e.g. `queue_etcd::EmbeddedServer::client_endpoints`).
    pub async fn connect(endpoints: &[String]) -> std::result::Result<Self, Error> {
        let client = Client::connect(endpoints, None).await?;
        Ok(EtcdKv { client })
    }

    /// Wraps an already-connected client, for callers that manage their own
    /// connection options (TLS, auth) outside this crate's concern.
    pub fn new(client: Client) -> Self {
        EtcdKv { client }
    }
}

fn wrap(err: etcd_client::Error) -> CoreError {
    CoreError::KvUnavailable(err.to_string())
}

fn to_etcd_compare(compare: &Compare) -> EtcdCompare {
    match compare {
        Compare::CreateRevisionEqual { key, revision } => {
            EtcdCompare::create_revision(key.as_bytes(), CompareOp::Equal, *revision)
        }
        Compare::CreateRevisionGreater { key, revision } => {
            EtcdCompare::create_revision(key.as_bytes(), CompareOp::Greater, *revision)
        }
    }
}

fn to_etcd_op(op: &TxnOp) -> EtcdTxnOp {
    match op {
        TxnOp::Put { key, value } => EtcdTxnOp::put(key.as_bytes(), value.clone(), None),
        TxnOp::Delete { key } => EtcdTxnOp::delete(key.as_bytes(), None),
    }
}

#[async_trait]
impl KvStore for EtcdKv {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64> {
        let mut client = self.client.clone();
        let resp = client.put(key, value, None).await.map_err(wrap)?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or(0))
    }

    async fn get_range(&self, prefix: &str, limit: Option<i64>) -> Result<(Vec<KvPair>, i64)> {
        let mut client = self.client.clone();
        let mut opts = GetOptions::new().with_prefix();
        if let Some(limit) = limit {
            opts = opts.with_limit(limit);
        }
        let resp = client.get(prefix, Some(opts)).await.map_err(wrap)?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
        let pairs = resp
            .kvs()
            .iter()
            .map(|kv| KvPair {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
                mod_revision: kv.mod_revision(),
            })
            .collect();
        Ok((pairs, revision))
    }

    async fn delete_range(&self, prefix: &str) -> Result<i64> {
        let mut client = self.client.clone();
        let resp = client
            .delete(prefix, Some(DeleteOptions::new().with_prefix()))
            .await
            .map_err(wrap)?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or(0))
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResult> {
        let mut client = self.client.clone();
        let compares: Vec<EtcdCompare> = txn.compares.iter().map(to_etcd_compare).collect();
        let success: Vec<EtcdTxnOp> = txn.success.iter().map(to_etcd_op).collect();
        let failure: Vec<EtcdTxnOp> = txn.failure.iter().map(to_etcd_op).collect();

        let etcd_txn = etcd_client::Txn::new()
            .when(compares)
            .and_then(success)
            .or_else(failure);

        let resp = client.txn(etcd_txn).await.map_err(wrap)?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
        Ok(TxnResult {
            succeeded: resp.succeeded(),
            revision,
        })
    }

    async fn watch(&self, target: WatchTarget, start_revision: i64) -> Result<WatchStream> {
        let mut client = self.client.clone();
        let (key, opts) = match target {
            WatchTarget::Key(key) => (key, WatchOptions::new().with_start_revision(start_revision)),
            WatchTarget::Prefix(prefix) => (
                prefix,
                WatchOptions::new()
                    .with_prefix()
                    .with_start_revision(start_revision),
            ),
        };

        let (_watcher, stream) = client.watch(key, Some(opts)).await.map_err(wrap)?;

        // Each watch message may carry several events; unfold one message at
        // a time into a `Vec`, then flatten to the single-event stream the
        // core expects.
        let batches = futures::stream::try_unfold(stream, |mut stream| async move {
            loop {
                let message = stream.message().await.map_err(wrap)?;
                let Some(response) = message else {
                    return Ok::<_, CoreError>(None);
                };

                let mut decoded = Vec::new();
                for event in response.events() {
                    let Some(kv) = event.kv() else { continue };
                    let key = String::from_utf8_lossy(kv.key()).into_owned();
                    match event.event_type() {
                        etcd_client::EventType::Put => decoded.push(WatchEvent::Put(KvPair {
                            key,
                            value: kv.value().to_vec(),
                            mod_revision: kv.mod_revision(),
                        })),
                        etcd_client::EventType::Delete => {
                            decoded.push(WatchEvent::Delete {
                                key,
                                mod_revision: kv.mod_revision(),
                            });
                        }
                    }
                }

                if decoded.is_empty() {
                    continue;
                }
                return Ok(Some((decoded, stream)));
            }
        });

        let events = batches
            .map_ok(|decoded| futures::stream::iter(decoded.into_iter().map(Ok::<WatchEvent, CoreError>)))
            .try_flatten();
        Ok(events.boxed())
    }

    async fn current_revision(&self) -> Result<i64> {
        // Any Get's response header carries the store's revision at the time
        // of the read, whether or not the probe key matches anything; `\0`
        // sorts before every real key so the scan is effectively free.
        let mut client = self.client.clone();
        let resp = client
            .get(vec![0u8], Some(GetOptions::new().with_limit(1)))
            .await
            .map_err(wrap)?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or(0))
    }
}
