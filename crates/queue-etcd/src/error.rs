/// Errors specific to wiring the core against a real etcd cluster: connection
/// setup and [`crate::ServerConfig`] validation. Failures from the `KvStore`
/// trait methods themselves surface directly as `queue_core::Error::KvUnavailable`
/// (see `etcd_kv::wrap`), since that is the only variant the core boundary
/// exposes for a collaborator failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to connect to etcd: {0}")]
    Connect(#[from] etcd_client::Error),

    #[error("invalid server config: {0}")]
    Config(String),
}

impl From<Error> for queue_core::Error {
    fn from(err: Error) -> Self {
        queue_core::Error::KvUnavailable(err.to_string())
    }
}
