//! A durable, priority-ordered job queue layered over a strongly-consistent,
//! replicated key-value store (`Put`/`Get(range)`/`Delete(range)`/
//! `Txn(if/then/else)`/`Watch(key|prefix, fromRevision)`).
//!
//! The crate is organized the way the components are described: a pure [`codec`]
//! mapping items to ordered keys, the [`item`] record itself, the [`kv`]
//! collaborator boundary (plus [`memory_kv`], an in-process implementation of
//! it), the [`subscribe`] fan-out engine, and [`queue`], which ties all of the
//! above into the public `Queue` surface.

pub mod codec;
pub mod error;
pub mod item;
pub mod kv;
pub mod memory_kv;
pub mod queue;
pub mod subscribe;

pub use codec::KeyLayout;
pub use error::{Error, Result};
pub use item::Item;
pub use kv::{KvServerHandle, KvStore};
pub use queue::Queue;
pub use subscribe::Subscription;
