//! Durable log-structured key-value engine.
//!
//! One store per replication group, one directory per store. See
//! [`engine::LogStore`] for the write/recovery model and [`snapshot`] for
//! the snapshot stream format.

pub mod batch;
pub mod engine;
pub mod error;
pub mod snapshot;

pub use batch::WriteBatch;
pub use engine::{LogStore, SnapshotIter};
pub use error::{Result, StoreError};
pub use snapshot::{read_snapshot, write_snapshot, SnapshotToken, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};
