//! Unified error domain shared by every croft crate.
//!
//! Storage and consensus layers have their own internal error types; anything
//! that crosses a public API boundary is converted into [`Error`] so callers
//! match on one enum.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the croft [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the croft public APIs.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested record does not exist.
    #[error("record not found")]
    NotFound,

    /// The operation did not complete within its deadline. The underlying
    /// proposal may still commit after this is returned.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The lookup argument has a shape the state machine does not handle.
    #[error("unsupported query: {0}")]
    UnsupportedQuery(String),

    /// A proposal reached the state machine with no payload.
    #[error("proposal carries no data")]
    NullDataProposal,

    /// A time-series proposal reached the state machine without a
    /// timestamp. All such records would share one index key.
    #[error("time-series record {0} carries no timestamp")]
    MissingTimestamp(u64),

    /// A stored key does not decode under any known key class.
    #[error("invalid key prefix: 0x{0:02x}")]
    InvalidKeyPrefix(u8),

    /// The requested metric never appears in the fetched telemetry records.
    #[error("metric key not found: {0}")]
    MetricKeyNotFound(String),

    /// The request landed on a follower and could not be forwarded.
    #[error("not leader for group {group} (leader: {leader:?})")]
    NotLeader { group: u64, leader: Option<u64> },

    /// No replication group with this id is hosted on this node.
    #[error("replication group {0} not found on this host")]
    GroupNotFound(u64),

    /// The host is shutting down and no longer accepts requests.
    #[error("node host is shut down")]
    Shutdown,

    /// Consensus-layer failure (election, replication, membership).
    #[error("raft error: {0}")]
    Raft(String),

    /// Durable storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Payload or wire-frame (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Creates a raft-layer error from any displayable source.
    pub fn raft(msg: impl std::fmt::Display) -> Self {
        Error::Raft(msg.to_string())
    }

    /// Creates a storage-layer error from any displayable source.
    pub fn storage(msg: impl std::fmt::Display) -> Self {
        Error::Storage(msg.to_string())
    }

    /// Creates a serialization error from any displayable source.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Error::Serialization(msg.to_string())
    }

    /// True when the error indicates a missing record rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    /// True when retrying against the same host may succeed (leadership in
    /// flux or a deadline expired under load).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NotLeader { .. } | Error::Timeout(_))
    }

    /// The leader hint carried by a `NotLeader` rejection, if any.
    pub fn leader_hint(&self) -> Option<u64> {
        match self {
            Error::NotLeader { leader, .. } => *leader,
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for Error {
    fn from(e: bincode::error::EncodeError) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(e: bincode::error::DecodeError) -> Self {
        Error::Serialization(e.to_string())
    }
}
