//! Engine-internal error type.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A log frame failed its checksum or could not be decoded. Recovery
    /// truncates the log here; seeing this after open means live corruption.
    #[error("corrupt log frame at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("bad snapshot stream: {0}")]
    Snapshot(String),

    /// The cancellation token fired while streaming a snapshot.
    #[error("snapshot streaming cancelled")]
    Cancelled,

    /// The store directory is already open elsewhere in this process.
    #[error("store already open: {0}")]
    Locked(PathBuf),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

impl From<StoreError> for croft_commons::Error {
    fn from(e: StoreError) -> Self {
        croft_commons::Error::Storage(e.to_string())
    }
}
