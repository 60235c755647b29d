//! The boundary the core is written against: a configured KV client handle
//! offering `Put`, `Get(range)`, `Delete(range)`, `Txn(if/then/else)`, and
//! `Watch(key|prefix, fromRevision)` (§1). The embedded server lifecycle is an
//! opaque external collaborator (§1 Non-goals), represented here only by the
//! [`KvServerHandle`] facade.
//!
//! Grounded on `KeyValueStore`/`KeyValueBucket` in
//! `examples/other_examples/.../key_value_store.rs.rs`, which draws the same
//! `#[async_trait]` boundary between a generic store trait and backend-specific
//! implementations (etcd, NATS, in-memory) to keep callers decoupled from any
//! one backend.

use crate::error::Result;
use async_trait::async_trait;
use futures_core::stream::BoxStream;

/// A single key/value pair as returned by a range read, carrying the
/// revision at which that key was last modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: i64,
}

/// A comparison guard for a [`Txn`]'s `If` clause.
#[derive(Debug, Clone)]
pub enum Compare {
    /// True if `key`'s create revision equals `revision` (`0` means "does not exist").
    CreateRevisionEqual { key: String, revision: i64 },
    /// True if `key`'s create revision is greater than `revision` (`0` means "exists").
    CreateRevisionGreater { key: String, revision: i64 },
}

impl Compare {
    pub fn not_exists(key: impl Into<String>) -> Self {
        Compare::CreateRevisionEqual {
            key: key.into(),
            revision: 0,
        }
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Compare::CreateRevisionGreater {
            key: key.into(),
            revision: 0,
        }
    }
}

/// A single mutation within a [`Txn`]'s `Then`/`Else` branch.
#[derive(Debug, Clone)]
pub enum TxnOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// A conditional multi-key transaction: `If` all `compares` hold, execute
/// `success`; otherwise execute `failure`. Mirrors etcd's `Txn` (§1).
#[derive(Debug, Clone, Default)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: Compare) -> Self {
        self.compares.push(compare);
        self
    }

    pub fn and_then(mut self, op: TxnOp) -> Self {
        self.success.push(op);
        self
    }

    pub fn or_else(mut self, op: TxnOp) -> Self {
        self.failure.push(op);
        self
    }
}

/// The outcome of executing a [`Txn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnResult {
    /// Whether every `compare` in the `If` clause held.
    pub succeeded: bool,
    /// The revision at which the transaction committed.
    pub revision: i64,
}

/// What a watch observes: an exact key, or every key under a prefix.
#[derive(Debug, Clone)]
pub enum WatchTarget {
    Key(String),
    Prefix(String),
}

/// A single change-notification from a watch stream, in store revision order.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Put(KvPair),
    Delete { key: String, mod_revision: i64 },
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

/// The KV store operations the core requires of its collaborator (§1).
///
/// Implemented by `queue_etcd::EtcdKv` against a real etcd cluster, and by
/// [`crate::memory_kv::MemoryKv`] for tests and for embedding the queue
/// without any external process.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Writes `value` at `key` unconditionally, returning the commit revision.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64>;

    /// Returns up to `limit` key/value pairs at or after `prefix` in
    /// lexicographic order (ascending), and the revision the read was
    /// consistent at. `limit = None` means unbounded.
    async fn get_range(&self, prefix: &str, limit: Option<i64>) -> Result<(Vec<KvPair>, i64)>;

    /// Deletes every key at or under `prefix`, returning the commit revision.
    async fn delete_range(&self, prefix: &str) -> Result<i64>;

    /// Executes a conditional multi-key transaction atomically.
    async fn txn(&self, txn: Txn) -> Result<TxnResult>;

    /// Starts a watch on `target`, yielding events from `start_revision` onward.
    /// Events that happened before `start_revision` are never replayed (§4.D).
    async fn watch(&self, target: WatchTarget, start_revision: i64) -> Result<WatchStream>;

    /// The store's current revision, used to pin the starting point of a new watch.
    async fn current_revision(&self) -> Result<i64>;
}

/// A thin, deliberately opaque handle to the embedded KV server (§1 Non-goals:
/// bootstrap, data directory, and client endpoint wiring are excluded from the
/// core's concern; this trait only exposes what `spec.md` §6 lists as part of
/// the core's external surface: `ClientEndpoints` and `Stop`).
#[async_trait]
pub trait KvServerHandle: Send + Sync {
    fn client_endpoints(&self) -> Vec<String>;
    async fn stop(&self) -> Result<()>;
}
