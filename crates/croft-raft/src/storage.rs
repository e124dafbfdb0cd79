//! Combined raft storage for one group.
//!
//! Implements the combined `RaftStorage` trait (v1 API), split into a log
//! store and a state-machine adapter with `Adaptor` at group start. Log
//! bookkeeping persists through [`RaftLogStore`]; committed entries flow
//! into the group's [`StateMachine`] in batches.

use std::fmt::Debug;
use std::io::{Cursor, Write};
use std::ops::RangeBounds;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use openraft::storage::{LogState, RaftLogReader, RaftStorage, Snapshot};
use openraft::{
    AnyError, Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, OptionalSend,
    RaftSnapshotBuilder, SnapshotMeta, StorageError, StorageIOError, StoredMembership, Vote,
};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::log_store::RaftLogStore;
use crate::state_machine::{LogEntry, StateMachine};
use crate::types::{NodeId, NodeInfo, TypeConfig};

/// The most recent snapshot, kept in memory; its contents are always
/// reproducible from the state machine's own store.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub meta: SnapshotMeta<NodeId, NodeInfo>,
    pub data: Vec<u8>,
}

/// Log storage plus state-machine driver for one replication group.
pub struct GroupStorage {
    cluster_id: u64,
    log: RaftLogStore,
    state_machine: Arc<dyn StateMachine>,
    snapshot_idx: AtomicU64,
    current_snapshot: RwLock<Option<StoredSnapshot>>,
    cancel: CancellationToken,
}

impl Debug for GroupStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupStorage").field("cluster_id", &self.cluster_id).finish_non_exhaustive()
    }
}

fn log_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageIOError::new(ErrorSubject::Logs, ErrorVerb::Write, AnyError::new(&e)).into()
}

fn sm_err(verb: ErrorVerb, e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageIOError::new(ErrorSubject::StateMachine, verb, AnyError::new(&e)).into()
}

impl GroupStorage {
    pub fn new(
        cluster_id: u64,
        log: RaftLogStore,
        state_machine: Arc<dyn StateMachine>,
        cancel: CancellationToken,
    ) -> Self {
        GroupStorage {
            cluster_id,
            log,
            state_machine,
            snapshot_idx: AtomicU64::new(0),
            current_snapshot: RwLock::new(None),
            cancel,
        }
    }

    pub fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    pub fn state_machine(&self) -> &Arc<dyn StateMachine> {
        &self.state_machine
    }

    pub fn log(&self) -> &RaftLogStore {
        &self.log
    }

    /// Flushes a run of normal entries into the state machine, pushing one
    /// response (the applied index) per entry.
    async fn flush_normals(
        &self,
        pending: &mut Vec<LogEntry>,
        results: &mut Vec<Vec<u8>>,
    ) -> Result<(), StorageError<NodeId>> {
        if pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(pending);
        let acks = self
            .state_machine
            .update(batch)
            .await
            .map_err(|e| sm_err(ErrorVerb::Write, e))?;
        for ack in acks {
            results.push(ack.index.to_le_bytes().to_vec());
        }
        Ok(())
    }
}

/// Shared-handle log reader.
pub struct GroupLogReader {
    storage: Arc<GroupStorage>,
}

impl Clone for GroupLogReader {
    fn clone(&self) -> Self {
        GroupLogReader { storage: self.storage.clone() }
    }
}

impl RaftLogReader<TypeConfig> for GroupLogReader {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        self.storage.log.entries_in(range).map_err(log_err)
    }
}

/// Builds snapshots by streaming the state machine's own capture.
pub struct GroupSnapshotBuilder {
    storage: Arc<GroupStorage>,
}

impl RaftSnapshotBuilder<TypeConfig> for GroupSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let storage = &self.storage;
        let sm = &storage.state_machine;

        let handle =
            sm.prepare_snapshot().await.map_err(|e| sm_err(ErrorVerb::Read, e))?;
        let mut data = Vec::new();
        sm.save_snapshot(handle, &mut data as &mut (dyn Write + Send), &storage.cancel)
            .await
            .map_err(|e| sm_err(ErrorVerb::Read, e))?;

        let last_applied = storage.log.last_applied().map_err(log_err)?;
        let last_membership = storage.log.membership().map_err(log_err)?;

        let snapshot_idx = storage.snapshot_idx.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_id = match last_applied {
            Some(last) => format!("{}-{}-{}", last.leader_id, last.index, snapshot_idx),
            None => format!("--{snapshot_idx}"),
        };
        let meta = SnapshotMeta { last_log_id: last_applied, last_membership, snapshot_id };

        *storage.current_snapshot.write() =
            Some(StoredSnapshot { meta: meta.clone(), data: data.clone() });

        Ok(Snapshot { meta, snapshot: Box::new(Cursor::new(data)) })
    }
}

impl RaftLogReader<TypeConfig> for Arc<GroupStorage> {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        self.log.entries_in(range).map_err(log_err)
    }
}

#[allow(deprecated)] // RaftStorage is deprecated in favor of v2 traits, but v2 is sealed
impl RaftStorage<TypeConfig> for Arc<GroupStorage> {
    type LogReader = GroupLogReader;
    type SnapshotBuilder = GroupSnapshotBuilder;

    // --- Vote ---

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.log.set_vote(vote).map_err(log_err)
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        self.log.vote().map_err(log_err)
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.log.set_committed(committed).map_err(log_err)
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        self.log.committed().map_err(log_err)
    }

    // --- Log ---

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last_purged = self.log.purged().map_err(log_err)?;
        let last_log_id = self.log.last_entry_id().map_err(log_err)?.or(last_purged);
        Ok(LogState { last_purged_log_id: last_purged, last_log_id })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        GroupLogReader { storage: self.clone() }
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        self.log.append(entries.into_iter().collect()).map_err(log_err)
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError<NodeId>> {
        self.log.truncate_since(log_id.index).map_err(log_err)
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.log.purge_upto(log_id).map_err(log_err)
    }

    // --- State machine ---

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, NodeInfo>), StorageError<NodeId>>
    {
        let last_applied = self.log.last_applied().map_err(log_err)?;
        let membership = self.log.membership().map_err(log_err)?;
        Ok((last_applied, membership))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<Vec<u8>>, StorageError<NodeId>> {
        let mut results = Vec::with_capacity(entries.len());
        let mut pending: Vec<LogEntry> = Vec::new();
        let mut last_log_id = None;

        for entry in entries {
            last_log_id = Some(entry.log_id);
            match &entry.payload {
                EntryPayload::Normal(data) => pending.push(LogEntry {
                    index: entry.log_id.index,
                    term: entry.log_id.leader_id.term,
                    data: data.clone(),
                }),
                EntryPayload::Blank => {
                    self.flush_normals(&mut pending, &mut results).await?;
                    results.push(Vec::new());
                }
                EntryPayload::Membership(membership) => {
                    self.flush_normals(&mut pending, &mut results).await?;
                    self.log
                        .set_membership(&StoredMembership::new(
                            Some(entry.log_id),
                            membership.clone(),
                        ))
                        .map_err(log_err)?;
                    results.push(Vec::new());
                }
            }
        }
        self.flush_normals(&mut pending, &mut results).await?;

        if let Some(log_id) = last_log_id {
            self.log.set_last_applied(Some(log_id)).map_err(log_err)?;
        }
        Ok(results)
    }

    // --- Snapshots ---

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        GroupSnapshotBuilder { storage: self.clone() }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, NodeInfo>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let data = snapshot.into_inner();

        let mut reader = Cursor::new(data.as_slice());
        self.state_machine
            .recover_from_snapshot(&mut reader)
            .await
            .map_err(|e| sm_err(ErrorVerb::Write, e))?;

        self.log.set_last_applied(meta.last_log_id).map_err(log_err)?;
        self.log.set_membership(&meta.last_membership).map_err(log_err)?;
        if let Some(last_log_id) = meta.last_log_id {
            self.log.purge_upto(last_log_id).map_err(log_err)?;
        }

        *self.current_snapshot.write() = Some(StoredSnapshot { meta: meta.clone(), data });
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let current = self.current_snapshot.read();
        Ok(current.as_ref().map(|snapshot| Snapshot {
            meta: snapshot.meta.clone(),
            snapshot: Box::new(Cursor::new(snapshot.data.clone())),
        }))
    }
}
