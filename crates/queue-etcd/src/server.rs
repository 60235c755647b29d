//! [`ServerConfig`]/[`EmbeddedServer`]: the opaque `KvServerHandle` facade
//! `queue_core::kv` asks for. Bootstrapping, running, or stopping an etcd
//! process is out of scope here; this type only turns a config into the
//! dialable endpoints a [`crate::EtcdKv`] connects to, and back again.

use crate::error::Error;
use async_trait::async_trait;
use queue_core::kv::KvServerHandle;
use std::path::PathBuf;

/// Where an already-running etcd member listens, and where it keeps its data.
/// This crate never reads `data_dir` or `peer_port` itself; they exist so a
/// caller's own process-bootstrap code and this handle can agree on the same
/// config value.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub client_port: u16,
    pub peer_port: u16,
    pub data_dir: PathBuf,
}

/// A handle over a set of client endpoint URLs derived from a [`ServerConfig`].
/// `stop` only releases this handle's own bookkeeping; it does not terminate
/// any etcd process.
pub struct EmbeddedServer {
    endpoints: Vec<String>,
}

impl EmbeddedServer {
    pub fn new(config: &ServerConfig) -> std::result::Result<Self, Error> {
        if config.client_port == 0 {
            return Err(Error::Config("client_port must be nonzero".to_string()));
        }
        Ok(EmbeddedServer {
            endpoints: vec![format!("http://127.0.0.1:{}", config.client_port)],
        })
    }
}

#[async_trait]
impl KvServerHandle for EmbeddedServer {
    fn client_endpoints(&self) -> Vec<String> {
        self.endpoints.clone()
    }

    async fn stop(&self) -> queue_core::Result<()> {
        Ok(())
    }
}
