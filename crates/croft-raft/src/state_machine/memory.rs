//! In-memory state machine for live runtime state.
//!
//! Holds exactly one serialized value. Earlier entries in an update batch
//! are superseded by later ones, duplicate payloads are not re-published,
//! and nothing is persisted: after a restart the value is rebuilt from
//! whatever raft replays.

use std::any::Any;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use croft_commons::error::{Error, Result};
use croft_commons::wire::{decode, encode, Proposal, ProposalOp, Query, QueryResult};

use super::{HandleInner, LogEntry, SnapshotHandle, StateMachine, UpdateResult};

/// State machine holding a group's single current value.
pub struct CurrentStateMachine {
    cluster_id: u64,
    value: RwLock<Option<Vec<u8>>>,
    applied: AtomicU64,
    changes: watch::Sender<Option<Vec<u8>>>,
}

impl CurrentStateMachine {
    pub fn new(cluster_id: u64) -> Self {
        let (changes, _) = watch::channel(None);
        CurrentStateMachine {
            cluster_id,
            value: RwLock::new(None),
            applied: AtomicU64::new(0),
            changes,
        }
    }

    /// A receiver that observes every distinct published value.
    pub fn subscribe(&self) -> watch::Receiver<Option<Vec<u8>>> {
        self.changes.subscribe()
    }

    fn install(&self, next: Option<Vec<u8>>) {
        let mut value = self.value.write();
        if *value == next {
            return;
        }
        *value = next.clone();
        // Subscribers are optional; send failure just means nobody listens.
        let _ = self.changes.send(next);
    }
}

#[async_trait]
impl StateMachine for CurrentStateMachine {
    fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    async fn open(&self) -> Result<u64> {
        Ok(0)
    }

    async fn update(&self, entries: Vec<LogEntry>) -> Result<Vec<UpdateResult>> {
        let gate = self.applied.load(Ordering::SeqCst);
        let results = entries.iter().map(|e| UpdateResult { index: e.index }).collect();

        // Only the last fresh entry matters; everything before it in the
        // batch is superseded.
        let Some(last) = entries.into_iter().filter(|e| e.index > gate).next_back() else {
            return Ok(results);
        };
        if last.data.is_empty() {
            return Err(Error::NullDataProposal);
        }
        let proposal = Proposal::decode(&last.data)?;
        match proposal.op {
            ProposalOp::Update => {
                if proposal.data.is_empty() {
                    return Err(Error::NullDataProposal);
                }
                self.install(Some(proposal.data));
            }
            ProposalOp::Delete => self.install(None),
        }
        self.applied.store(last.index, Ordering::SeqCst);
        Ok(results)
    }

    /// The query shape is ignored; there is only one value to return.
    async fn lookup(&self, _query: Query) -> Result<QueryResult> {
        Ok(QueryResult::Value(self.value.read().clone()))
    }

    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    async fn prepare_snapshot(&self) -> Result<SnapshotHandle> {
        Ok(SnapshotHandle(HandleInner::Value(self.value.read().clone())))
    }

    async fn save_snapshot(
        &self,
        handle: SnapshotHandle,
        writer: &mut (dyn Write + Send),
        _cancel: &CancellationToken,
    ) -> Result<()> {
        match handle.0 {
            HandleInner::Value(value) => {
                let bytes = encode(&value)?;
                writer.write_all(&bytes)?;
                writer.flush()?;
                Ok(())
            }
            HandleInner::Store(_) => Err(Error::Storage(
                "snapshot handle does not belong to an in-memory state machine".into(),
            )),
        }
    }

    async fn recover_from_snapshot(&self, reader: &mut (dyn Read + Send)) -> Result<()> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let value: Option<Vec<u8>> = decode(&bytes)?;
        self.install(value);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn applied_index(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
