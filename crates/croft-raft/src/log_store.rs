//! Durable per-group raft log.
//!
//! Votes, the committed pointer, membership, the last-applied pointer and
//! the log entries themselves all persist through one engine store in the
//! group's `raft/` subdirectory. Every mutation is a synced batch, so a
//! granted vote or appended entry is never lost to a crash, and restart
//! recovery can replay the log against the state machine's applied-index
//! gate.

use std::ops::RangeBounds;
use std::path::Path;

use openraft::{Entry, EntryPayload, LogId, StoredMembership, Vote};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use croft_commons::error::Result;
use croft_commons::wire::{decode, encode};
use croft_store::{LogStore, WriteBatch};

use crate::types::{NodeId, NodeInfo, TypeConfig};

const VOTE_KEY: &[u8] = b"meta:vote";
const COMMITTED_KEY: &[u8] = b"meta:committed";
const PURGED_KEY: &[u8] = b"meta:purged";
const MEMBERSHIP_KEY: &[u8] = b"meta:membership";
const LAST_APPLIED_KEY: &[u8] = b"meta:last_applied";
const ENTRY_PREFIX: &[u8] = b"entry:";

/// One stored log entry: its id plus the bincode-framed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryRecord {
    log_id: LogId<NodeId>,
    payload: Vec<u8>,
}

// Big-endian indexes keep prefix scans in index order.
fn entry_key(index: u64) -> Vec<u8> {
    let mut key = ENTRY_PREFIX.to_vec();
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn entry_index(key: &[u8]) -> Option<u64> {
    let suffix = key.strip_prefix(ENTRY_PREFIX)?;
    Some(u64::from_be_bytes(suffix.try_into().ok()?))
}

/// Durable raft log and vote storage for one group.
pub struct RaftLogStore {
    store: LogStore,
}

impl RaftLogStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Ok(RaftLogStore { store: LogStore::open(dir)? })
    }

    fn get_meta<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.store.lookup(key) {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn set_meta<T: Serialize>(&self, key: &[u8], value: &T) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key.to_vec(), encode(value)?);
        self.store.apply(batch)?;
        Ok(())
    }

    pub fn vote(&self) -> Result<Option<Vote<NodeId>>> {
        self.get_meta(VOTE_KEY)
    }

    pub fn set_vote(&self, vote: &Vote<NodeId>) -> Result<()> {
        self.set_meta(VOTE_KEY, vote)
    }

    pub fn committed(&self) -> Result<Option<LogId<NodeId>>> {
        Ok(self.get_meta::<Option<LogId<NodeId>>>(COMMITTED_KEY)?.flatten())
    }

    pub fn set_committed(&self, committed: Option<LogId<NodeId>>) -> Result<()> {
        self.set_meta(COMMITTED_KEY, &committed)
    }

    pub fn purged(&self) -> Result<Option<LogId<NodeId>>> {
        Ok(self.get_meta::<Option<LogId<NodeId>>>(PURGED_KEY)?.flatten())
    }

    pub fn membership(&self) -> Result<StoredMembership<NodeId, NodeInfo>> {
        Ok(self.get_meta(MEMBERSHIP_KEY)?.unwrap_or_default())
    }

    pub fn set_membership(&self, membership: &StoredMembership<NodeId, NodeInfo>) -> Result<()> {
        self.set_meta(MEMBERSHIP_KEY, membership)
    }

    /// True once any membership has been persisted, i.e. the group was
    /// bootstrapped (or joined) at some point in this directory's history.
    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.membership()?.membership().voter_ids().next().is_some())
    }

    pub fn last_applied(&self) -> Result<Option<LogId<NodeId>>> {
        Ok(self.get_meta::<Option<LogId<NodeId>>>(LAST_APPLIED_KEY)?.flatten())
    }

    pub fn set_last_applied(&self, log_id: Option<LogId<NodeId>>) -> Result<()> {
        self.set_meta(LAST_APPLIED_KEY, &log_id)
    }

    /// Appends entries in one durable batch.
    pub fn append(&self, entries: Vec<Entry<TypeConfig>>) -> Result<()> {
        let mut batch = WriteBatch::new();
        for entry in entries {
            let record =
                EntryRecord { log_id: entry.log_id, payload: encode(&entry.payload)? };
            batch.put(entry_key(entry.log_id.index), encode(&record)?);
        }
        self.store.apply(batch)?;
        Ok(())
    }

    /// All entries whose index falls within `range`, in index order.
    pub fn entries_in(&self, range: impl RangeBounds<u64>) -> Result<Vec<Entry<TypeConfig>>> {
        let mut entries = Vec::new();
        for (key, value) in self.store.scan_prefix(ENTRY_PREFIX) {
            let Some(index) = entry_index(&key) else { continue };
            if !range.contains(&index) {
                continue;
            }
            let record: EntryRecord = decode(&value)?;
            let payload: EntryPayload<TypeConfig> = decode(&record.payload)?;
            entries.push(Entry { log_id: record.log_id, payload });
        }
        Ok(entries)
    }

    pub fn last_entry_id(&self) -> Result<Option<LogId<NodeId>>> {
        let entries = self.store.scan_prefix(ENTRY_PREFIX);
        match entries.last() {
            Some((_, value)) => {
                let record: EntryRecord = decode(value)?;
                Ok(Some(record.log_id))
            }
            None => Ok(None),
        }
    }

    /// Removes all entries at or above `index` (conflict truncation).
    pub fn truncate_since(&self, index: u64) -> Result<()> {
        let mut batch = WriteBatch::new();
        for (key, _) in self.store.scan_prefix(ENTRY_PREFIX) {
            if entry_index(&key).is_some_and(|i| i >= index) {
                batch.delete(key);
            }
        }
        self.store.apply(batch)?;
        Ok(())
    }

    /// Removes all entries up to and including `log_id` and records it as
    /// the purge watermark, in one atomic batch.
    pub fn purge_upto(&self, log_id: LogId<NodeId>) -> Result<()> {
        let mut batch = WriteBatch::new();
        for (key, _) in self.store.scan_prefix(ENTRY_PREFIX) {
            if entry_index(&key).is_some_and(|i| i <= log_id.index) {
                batch.delete(key);
            }
        }
        batch.put(PURGED_KEY.to_vec(), encode(&Some(log_id))?);
        self.store.apply(batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::CommittedLeaderId;
    use tempfile::TempDir;

    fn log_id(term: u64, index: u64) -> LogId<NodeId> {
        LogId::new(CommittedLeaderId::new(term, 1), index)
    }

    fn blank(term: u64, index: u64) -> Entry<TypeConfig> {
        Entry { log_id: log_id(term, index), payload: EntryPayload::Blank }
    }

    #[test]
    fn vote_and_meta_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = RaftLogStore::open(dir.path()).unwrap();
            assert!(store.vote().unwrap().is_none());
            store.set_vote(&Vote::new(3, 1)).unwrap();
            store.set_committed(Some(log_id(3, 9))).unwrap();
            store.set_last_applied(Some(log_id(3, 9))).unwrap();
        }
        let store = RaftLogStore::open(dir.path()).unwrap();
        assert_eq!(store.vote().unwrap(), Some(Vote::new(3, 1)));
        assert_eq!(store.committed().unwrap(), Some(log_id(3, 9)));
        assert_eq!(store.last_applied().unwrap(), Some(log_id(3, 9)));
        assert!(!store.is_initialized().unwrap());
    }

    #[test]
    fn entries_append_scan_truncate_purge() {
        let dir = TempDir::new().unwrap();
        let store = RaftLogStore::open(dir.path()).unwrap();
        store.append((1..=10).map(|i| blank(1, i)).collect()).unwrap();

        let mid = store.entries_in(4..=6).unwrap();
        assert_eq!(
            mid.iter().map(|e| e.log_id.index).collect::<Vec<_>>(),
            vec![4, 5, 6]
        );
        assert_eq!(store.last_entry_id().unwrap(), Some(log_id(1, 10)));

        store.truncate_since(8).unwrap();
        assert_eq!(store.last_entry_id().unwrap(), Some(log_id(1, 7)));

        store.purge_upto(log_id(1, 3)).unwrap();
        assert_eq!(store.purged().unwrap(), Some(log_id(1, 3)));
        let rest = store.entries_in(..).unwrap();
        assert_eq!(
            rest.iter().map(|e| e.log_id.index).collect::<Vec<_>>(),
            vec![4, 5, 6, 7]
        );
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = RaftLogStore::open(dir.path()).unwrap();
            store.append(vec![blank(1, 1), blank(1, 2)]).unwrap();
        }
        let store = RaftLogStore::open(dir.path()).unwrap();
        assert_eq!(store.entries_in(..).unwrap().len(), 2);
    }
}
