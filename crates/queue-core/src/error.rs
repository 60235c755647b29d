/// Errors surfaced by the core across [`crate::kv::KvStore`], the subscription
/// engine, and [`crate::queue::Queue`]'s public operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operation's cancellation token fired before (or during) the call.
    #[error("operation canceled")]
    Cancelled,

    /// A call against the underlying KV store failed (network, store shutdown, ...).
    #[error("kv store unavailable: {0}")]
    KvUnavailable(String),

    /// An `Enqueue` targeted a key already present under the completed prefix.
    /// Terminal states are immutable; the store was left unchanged.
    #[error("item {0:?} is already completed; terminal states are immutable")]
    TerminalStateViolation(String),

    /// A value read from the KV store could not be decoded into an [`crate::item::Item`].
    #[error("failed to decode item from kv value: {0}")]
    Decode(#[from] serde_json::Error),

    /// A key did not match the expected pending/completed key layout.
    #[error("malformed key {0:?}: {1}")]
    MalformedKey(String, &'static str),

    /// An operation was attempted after [`crate::queue::Queue::stop`] was called.
    #[error("queue has been stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, Error>;
