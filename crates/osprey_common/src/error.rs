use thiserror::Error;

/// Convenience alias for `Result<T, OspreyError>`.
pub type OspreyResult<T> = Result<T, OspreyError>;

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum OspreyError {
    #[error("Replication error: {0}")]
    Replication(#[from] ReplicationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OspreyError {
    /// True when the error is a cancelled replication storage operation,
    /// i.e. the calling source was terminated mid-call. Shipper loops use
    /// this to unwind cleanly instead of treating the failure as fatal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, OspreyError::Replication(ReplicationError::Cancelled))
    }
}

/// Errors surfaced by the replication queue storage and the peer registry.
///
/// `Cancelled` is special: it means the storage call was interrupted because
/// the source that issued it was concurrently terminated. Every other variant
/// from a background thread escalates to a fatal node abort (see the error
/// policies on the source manager).
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Durable queue store failure (lost session, write rejected, ...).
    #[error("Queue storage failure: {0}")]
    Store(String),

    /// Storage operation interrupted because the calling source was
    /// terminated.
    #[error("Storage operation cancelled: replication source was terminated")]
    Cancelled,

    #[error("Unknown replication peer: {0}")]
    PeerNotFound(String),

    #[error("Malformed replication queue id: {0}")]
    InvalidQueueId(String),
}

impl ReplicationError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReplicationError::Cancelled)
    }
}
