//! State machine contract for replicated groups.
//!
//! Every group drives an implementation of [`StateMachine`] through the same
//! lifecycle: `open` once before any raft traffic, `update` for committed
//! entries, `lookup` for reads, snapshot save/recover for log compaction and
//! follower catch-up, `close` on shutdown.

use std::any::Any;
use std::io::{Read, Write};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use croft_commons::error::Result;
use croft_commons::wire::{Query, QueryResult};
use croft_store::SnapshotToken;

mod disk;
mod memory;

pub use disk::{KvStateMachine, TsStateMachine};
pub use memory::CurrentStateMachine;

/// A committed raft entry handed to [`StateMachine::update`].
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub data: Vec<u8>,
}

/// Per-entry acknowledgement from an update batch. The value echoed back to
/// the proposer is the entry's log index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateResult {
    pub index: u64,
}

/// Opaque capture returned by [`StateMachine::prepare_snapshot`], consumed
/// by `save_snapshot`. Capturing is cheap and happens under the update lock;
/// streaming happens afterwards without blocking writers.
pub struct SnapshotHandle(pub(crate) HandleInner);

pub(crate) enum HandleInner {
    /// A disk store capture.
    Store(SnapshotToken),
    /// An in-memory single value.
    Value(Option<Vec<u8>>),
}

/// The replicated state machine driven by one group.
///
/// `update` must be deterministic and idempotent with respect to log
/// indexes: entries at or below the last applied index are acknowledged
/// without re-applying, so crash-recovery replay never duplicates effects.
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// The replication group this machine belongs to.
    fn cluster_id(&self) -> u64;

    /// Opens the machine and returns the index of the last applied entry
    /// (0 when nothing has ever been applied). Called once, before the
    /// group processes any traffic.
    async fn open(&self) -> Result<u64>;

    /// Applies a batch of committed entries in log order.
    async fn update(&self, entries: Vec<LogEntry>) -> Result<Vec<UpdateResult>>;

    /// Serves a read against locally applied state.
    async fn lookup(&self, query: Query) -> Result<QueryResult>;

    /// Durability barrier: everything applied so far survives a crash.
    async fn sync(&self) -> Result<()>;

    /// Captures a point-in-time snapshot handle without blocking updates.
    async fn prepare_snapshot(&self) -> Result<SnapshotHandle>;

    /// Streams a captured snapshot, checking `cancel` between records.
    async fn save_snapshot(
        &self,
        handle: SnapshotHandle,
        writer: &mut (dyn Write + Send),
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Replaces all state with the contents of a snapshot stream.
    async fn recover_from_snapshot(&self, reader: &mut (dyn Read + Send)) -> Result<()>;

    /// Releases resources. No calls may follow.
    async fn close(&self) -> Result<()>;

    /// The last applied index as cached by `open`/`update`.
    fn applied_index(&self) -> u64;

    /// Downcast hook for flavor-specific clients (e.g. change subscriptions
    /// on [`CurrentStateMachine`]).
    fn as_any(&self) -> &dyn Any;
}
