//! The real-world `queue_core::kv::KvStore` backend: [`EtcdKv`] against a
//! live etcd cluster, plus [`EmbeddedServer`]/[`ServerConfig`], the thin
//! facade exposing a cluster's dialable endpoints to the core.

mod error;
mod etcd_kv;
mod server;

pub use error::Error;
pub use etcd_kv::EtcdKv;
pub use server::{EmbeddedServer, ServerConfig};
