//! The `error` module defines the error types used within `popmq`.
//!
//! `BrokerError` is what callers of the core API see. Storage problems are
//! kept in their own `StorageError` so the persistence layer does not need
//! to know about routing or queue semantics.

use thiserror::Error;

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors reported synchronously to callers of the broker API.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Publish, bind or delete against an exchange that was never declared.
    #[error("unknown exchange '{0}'")]
    UnknownExchange(String),

    /// Operation against a queue that was never declared (or was deleted).
    #[error("unknown queue '{0}'")]
    UnknownQueue(String),

    /// Redeclaration with parameters incompatible with the existing entity.
    #[error("{entity} '{name}' already declared with different parameters: {reason}")]
    Conflict {
        entity: &'static str,
        name: String,
        reason: String,
    },

    /// Ack or nack for a delivery tag that is not currently in flight.
    #[error("unknown delivery tag {tag} on queue '{queue}'")]
    UnknownTag { queue: String, tag: u64 },

    /// Second consumer on an exclusive queue.
    #[error("queue '{0}' is exclusive and already has a consumer")]
    ExclusiveQueue(String),

    /// Operation not permitted on a reserved entity such as the default exchange.
    #[error("access refused: {0}")]
    AccessRefused(String),

    /// The message store failed; the operation was not applied.
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

/// Failures raised by a `MessageStore` implementation.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("failed to encode or decode stored record: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl BrokerError {
    pub(crate) fn conflict(
        entity: &'static str,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            entity,
            name: name.into(),
            reason: reason.into(),
        }
    }
}
