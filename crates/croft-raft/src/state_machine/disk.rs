//! On-disk state machines over the log-structured engine.
//!
//! Two flavors share one core: [`KvStateMachine`] keeps plain entities,
//! [`TsStateMachine`] additionally maintains the timestamp index so paged
//! scans run in time order. Both gate replayed entries on the engine's
//! `applied_index` sentinel, which is committed in the same batch frame as
//! the data it covers.

use std::any::Any;
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use croft_commons::entity::{from_payload, KeyValueEntity, TimeSeriesEntity};
use croft_commons::error::{Error, Result};
use croft_commons::keys::{self, ParsedKey};
use croft_commons::wire::{PageQuery, Proposal, ProposalOp, Query, QueryResult, RawPage, SortOrder};
use croft_store::{LogStore, WriteBatch};

use super::{HandleInner, LogEntry, SnapshotHandle, StateMachine, UpdateResult};

/// Shared engine lifecycle, replay gating and query plumbing.
struct DiskCore {
    cluster_id: u64,
    dir: PathBuf,
    store: RwLock<Option<LogStore>>,
    applied: AtomicU64,
}

impl DiskCore {
    fn new(cluster_id: u64, dir: PathBuf) -> Self {
        DiskCore { cluster_id, dir, store: RwLock::new(None), applied: AtomicU64::new(0) }
    }

    fn open(&self) -> Result<u64> {
        let store = LogStore::open(&self.dir)?;
        let applied = store.applied_index()?.unwrap_or(0);
        self.applied.store(applied, Ordering::SeqCst);
        *self.store.write() = Some(store);
        Ok(applied)
    }

    fn with_store<R>(&self, f: impl FnOnce(&LogStore) -> Result<R>) -> Result<R> {
        let guard = self.store.read();
        match guard.as_ref() {
            Some(store) => f(store),
            None => Err(Error::Storage(format!(
                "state machine for group {} is not open",
                self.cluster_id
            ))),
        }
    }

    /// Applies a batch of committed entries. `index_ops` adds the flavor's
    /// secondary-index maintenance for one entity and may reject entities
    /// that violate the flavor's contract.
    fn apply_entries<E, F>(&self, entries: Vec<LogEntry>, index_ops: F) -> Result<Vec<UpdateResult>>
    where
        E: KeyValueEntity,
        F: Fn(&E, ProposalOp, &mut WriteBatch) -> Result<()>,
    {
        let gate = self.applied.load(Ordering::SeqCst);
        let mut batch = WriteBatch::new();
        let mut results = Vec::with_capacity(entries.len());
        let mut max_index = gate;

        for entry in entries {
            results.push(UpdateResult { index: entry.index });
            if entry.index <= gate {
                // Already durable before a crash; replay acknowledges only.
                continue;
            }
            if entry.data.is_empty() {
                return Err(Error::NullDataProposal);
            }
            let proposal = Proposal::decode(&entry.data)?;
            if proposal.data.is_empty() {
                return Err(Error::NullDataProposal);
            }
            let entity: E = from_payload(&proposal.data)?;
            let key = keys::encode_id(entity.identifier());
            match proposal.op {
                ProposalOp::Update => batch.put(key, proposal.data.clone()),
                ProposalOp::Delete => batch.delete(key),
            }
            index_ops(&entity, proposal.op, &mut batch)?;
            max_index = entry.index;
        }

        if max_index > gate {
            self.with_store(|store| Ok(store.apply_indexed(batch, max_index)?))?;
            self.applied.store(max_index, Ordering::SeqCst);
        }
        Ok(results)
    }

    fn get(&self, id: u64) -> Result<QueryResult> {
        self.with_store(|store| Ok(QueryResult::Value(store.lookup(&keys::encode_id(id)))))
    }

    fn count(&self) -> Result<QueryResult> {
        self.with_store(|store| {
            let count = store
                .iter()
                .filter(|(k, _)| matches!(keys::parse_key(k), Ok(ParsedKey::EntityId(_))))
                .count();
            Ok(QueryResult::Count(count as u64))
        })
    }

    /// Pages entities in key order, ignoring index keys and the sentinel.
    fn page_entities(&self, query: PageQuery) -> Result<QueryResult> {
        self.with_store(|store| {
            let values: Vec<Vec<u8>> = store
                .iter()
                .filter_map(|(k, v)| {
                    matches!(keys::parse_key(&k), Ok(ParsedKey::EntityId(_))).then_some(v)
                })
                .collect();
            Ok(QueryResult::Page(page_slice(values, query)))
        })
    }

    /// Pages entities in timestamp order by walking the index prefix. The
    /// scan stops at the first key outside the `0x00` prefix.
    fn page_by_time(&self, query: PageQuery) -> Result<QueryResult> {
        self.with_store(|store| {
            let mut ids = Vec::new();
            for (key, value) in store.iter() {
                if !keys::is_index_key(&key) {
                    break;
                }
                let (_ts, id) = keys::parse_index_entry(&key, &value)?;
                ids.push(id);
            }
            if query.sort_order == SortOrder::Desc {
                ids.reverse();
            }
            let offset = query.offset() as usize;
            let size = query.page_size as usize;
            if offset >= ids.len() || size == 0 {
                return Ok(QueryResult::Page(RawPage::default()));
            }
            let end = (offset + size).min(ids.len());
            let has_more = ids.len() > end;
            let entity_keys: Vec<Vec<u8>> =
                ids[offset..end].iter().map(|id| keys::encode_id(*id)).collect();
            let entities =
                store.lookup_batch(&entity_keys).into_iter().flatten().collect();
            Ok(QueryResult::Page(RawPage { entities, has_more }))
        })
    }

    fn prepare_snapshot(&self) -> Result<SnapshotHandle> {
        self.with_store(|store| Ok(SnapshotHandle(HandleInner::Store(store.prepare_snapshot()))))
    }

    fn save_snapshot(
        &self,
        handle: SnapshotHandle,
        writer: &mut (dyn Write + Send),
        cancel: &CancellationToken,
    ) -> Result<()> {
        match handle.0 {
            HandleInner::Store(token) => {
                self.with_store(|store| Ok(store.save_snapshot(&token, writer, cancel)?))
            }
            HandleInner::Value(_) => Err(Error::Storage(
                "snapshot handle does not belong to a disk state machine".into(),
            )),
        }
    }

    fn recover_from_snapshot(&self, reader: &mut (dyn Read + Send)) -> Result<()> {
        self.with_store(|store| {
            store.recover_from_snapshot(reader)?;
            let applied = store.applied_index()?.unwrap_or(0);
            self.applied.store(applied, Ordering::SeqCst);
            Ok(())
        })
    }

    fn sync(&self) -> Result<()> {
        self.with_store(|store| Ok(store.sync()?))
    }

    fn close(&self) -> Result<()> {
        if let Some(store) = self.store.write().take() {
            store.close()?;
        }
        Ok(())
    }
}

fn page_slice(mut values: Vec<Vec<u8>>, query: PageQuery) -> RawPage {
    if query.sort_order == SortOrder::Desc {
        values.reverse();
    }
    let offset = query.offset() as usize;
    let size = query.page_size as usize;
    if offset >= values.len() || size == 0 {
        return RawPage::default();
    }
    let end = (offset + size).min(values.len());
    let has_more = values.len() > end;
    RawPage { entities: values[offset..end].to_vec(), has_more }
}

/// On-disk state machine for plain keyed entities.
pub struct KvStateMachine<E> {
    core: DiskCore,
    _entity: PhantomData<fn() -> E>,
}

impl<E: KeyValueEntity> KvStateMachine<E> {
    pub fn new(cluster_id: u64, dir: impl Into<PathBuf>) -> Self {
        KvStateMachine { core: DiskCore::new(cluster_id, dir.into()), _entity: PhantomData }
    }
}

#[async_trait]
impl<E: KeyValueEntity> StateMachine for KvStateMachine<E> {
    fn cluster_id(&self) -> u64 {
        self.core.cluster_id
    }

    async fn open(&self) -> Result<u64> {
        self.core.open()
    }

    async fn update(&self, entries: Vec<LogEntry>) -> Result<Vec<UpdateResult>> {
        self.core.apply_entries::<E, _>(entries, |_, _, _| Ok(()))
    }

    async fn lookup(&self, query: Query) -> Result<QueryResult> {
        match query {
            Query::Get(id) => self.core.get(id),
            Query::Page(page) => self.core.page_entities(page),
            Query::Count => self.core.count(),
        }
    }

    async fn sync(&self) -> Result<()> {
        self.core.sync()
    }

    async fn prepare_snapshot(&self) -> Result<SnapshotHandle> {
        self.core.prepare_snapshot()
    }

    async fn save_snapshot(
        &self,
        handle: SnapshotHandle,
        writer: &mut (dyn Write + Send),
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.core.save_snapshot(handle, writer, cancel)
    }

    async fn recover_from_snapshot(&self, reader: &mut (dyn Read + Send)) -> Result<()> {
        self.core.recover_from_snapshot(reader)
    }

    async fn close(&self) -> Result<()> {
        self.core.close()
    }

    fn applied_index(&self) -> u64 {
        self.core.applied.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// On-disk state machine for time-series entities. Writes maintain the
/// timestamp index alongside the entity; paged reads run in time order.
pub struct TsStateMachine<E> {
    core: DiskCore,
    _entity: PhantomData<fn() -> E>,
}

impl<E: TimeSeriesEntity> TsStateMachine<E> {
    pub fn new(cluster_id: u64, dir: impl Into<PathBuf>) -> Self {
        TsStateMachine { core: DiskCore::new(cluster_id, dir.into()), _entity: PhantomData }
    }
}

#[async_trait]
impl<E: TimeSeriesEntity> StateMachine for TsStateMachine<E> {
    fn cluster_id(&self) -> u64 {
        self.core.cluster_id
    }

    async fn open(&self) -> Result<u64> {
        self.core.open()
    }

    async fn update(&self, entries: Vec<LogEntry>) -> Result<Vec<UpdateResult>> {
        self.core.apply_entries::<E, _>(entries, |entity, op, batch| {
            // A zero timestamp means the proposal skipped timestamp
            // assignment; every such record would land on one index key.
            if entity.timestamp() == 0 {
                return Err(Error::MissingTimestamp(entity.identifier()));
            }
            let index_key = keys::encode_timestamp(entity.timestamp());
            match op {
                ProposalOp::Update => {
                    batch.put(index_key, keys::encode_id(entity.identifier()))
                }
                ProposalOp::Delete => batch.delete(index_key),
            }
            Ok(())
        })
    }

    async fn lookup(&self, query: Query) -> Result<QueryResult> {
        match query {
            Query::Get(id) => self.core.get(id),
            Query::Page(page) => self.core.page_by_time(page),
            Query::Count => self.core.count(),
        }
    }

    async fn sync(&self) -> Result<()> {
        self.core.sync()
    }

    async fn prepare_snapshot(&self) -> Result<SnapshotHandle> {
        self.core.prepare_snapshot()
    }

    async fn save_snapshot(
        &self,
        handle: SnapshotHandle,
        writer: &mut (dyn Write + Send),
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.core.save_snapshot(handle, writer, cancel)
    }

    async fn recover_from_snapshot(&self, reader: &mut (dyn Read + Send)) -> Result<()> {
        self.core.recover_from_snapshot(reader)
    }

    async fn close(&self) -> Result<()> {
        self.core.close()
    }

    fn applied_index(&self) -> u64 {
        self.core.applied.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use croft_commons::entity::to_payload;
    use croft_commons::models::{Algorithm, EventLogEntry};
    use tempfile::TempDir;

    fn update_entry<E: KeyValueEntity>(index: u64, entity: &E) -> LogEntry {
        let proposal = Proposal::update(to_payload(entity).unwrap());
        LogEntry { index, term: 1, data: proposal.encode().unwrap() }
    }

    fn delete_entry<E: KeyValueEntity>(index: u64, entity: &E) -> LogEntry {
        let proposal = Proposal::delete(to_payload(entity).unwrap());
        LogEntry { index, term: 1, data: proposal.encode().unwrap() }
    }

    fn decode_page<E: KeyValueEntity>(result: QueryResult) -> (Vec<E>, bool) {
        match result {
            QueryResult::Page(page) => (
                page.entities.iter().map(|b| from_payload(b).unwrap()).collect(),
                page.has_more,
            ),
            other => panic!("expected a page, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn kv_update_get_delete() {
        let dir = TempDir::new().unwrap();
        let sm = KvStateMachine::<Algorithm>::new(1, dir.path());
        assert_eq!(sm.open().await.unwrap(), 0);

        let a = Algorithm::new(7, "fft");
        sm.update(vec![update_entry(1, &a)]).await.unwrap();
        match sm.lookup(Query::Get(7)).await.unwrap() {
            QueryResult::Value(Some(bytes)) => {
                assert_eq!(from_payload::<Algorithm>(&bytes).unwrap(), a)
            }
            other => panic!("unexpected {other:?}"),
        }

        sm.update(vec![delete_entry(2, &a)]).await.unwrap();
        assert_eq!(sm.lookup(Query::Get(7)).await.unwrap(), QueryResult::Value(None));
        assert_eq!(sm.applied_index(), 2);
    }

    #[tokio::test]
    async fn replayed_entries_are_acknowledged_but_not_reapplied() {
        let dir = TempDir::new().unwrap();
        let sm = KvStateMachine::<Algorithm>::new(1, dir.path());
        sm.open().await.unwrap();

        let a = Algorithm::new(1, "one");
        sm.update(vec![update_entry(1, &a)]).await.unwrap();
        sm.update(vec![delete_entry(2, &a)]).await.unwrap();
        sm.close().await.unwrap();

        // A restart replays from the log start; the gate skips both.
        let sm = KvStateMachine::<Algorithm>::new(1, dir.path());
        assert_eq!(sm.open().await.unwrap(), 2);
        let results = sm
            .update(vec![update_entry(1, &a), delete_entry(2, &a)])
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(sm.lookup(Query::Get(1)).await.unwrap(), QueryResult::Value(None));
        assert_eq!(sm.lookup(Query::Count).await.unwrap(), QueryResult::Count(0));
    }

    #[tokio::test]
    async fn empty_proposals_are_fatal() {
        let dir = TempDir::new().unwrap();
        let sm = KvStateMachine::<Algorithm>::new(1, dir.path());
        sm.open().await.unwrap();
        let err = sm
            .update(vec![LogEntry { index: 1, term: 1, data: Vec::new() }])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NullDataProposal));

        let hollow = Proposal::update(Vec::new()).encode().unwrap();
        let err = sm
            .update(vec![LogEntry { index: 1, term: 1, data: hollow }])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NullDataProposal));
    }

    #[tokio::test]
    async fn kv_pagination_walks_the_whole_set() {
        let dir = TempDir::new().unwrap();
        let sm = KvStateMachine::<Algorithm>::new(1, dir.path());
        sm.open().await.unwrap();

        let entries: Vec<LogEntry> = (1..=25u64)
            .map(|i| update_entry(i, &Algorithm::new(i, format!("alg-{i}"))))
            .collect();
        sm.update(entries).await.unwrap();

        let mut seen = Vec::new();
        for page_no in 1..=3u64 {
            let (entities, has_more) = decode_page::<Algorithm>(
                sm.lookup(Query::Page(PageQuery::new(page_no, 10, SortOrder::Asc)))
                    .await
                    .unwrap(),
            );
            assert_eq!(has_more, page_no < 3);
            seen.extend(entities.into_iter().map(|a| a.id));
        }
        assert_eq!(seen.len(), 25);
        assert_eq!(sm.lookup(Query::Count).await.unwrap(), QueryResult::Count(25));

        // Past the end.
        let (entities, has_more) = decode_page::<Algorithm>(
            sm.lookup(Query::Page(PageQuery::new(4, 10, SortOrder::Asc))).await.unwrap(),
        );
        assert!(entities.is_empty());
        assert!(!has_more);
    }

    #[tokio::test]
    async fn time_series_pages_in_timestamp_order() {
        let dir = TempDir::new().unwrap();
        let sm = TsStateMachine::<EventLogEntry>::new(2, dir.path());
        sm.open().await.unwrap();

        // Ids deliberately out of timestamp order.
        let mut entries = Vec::new();
        for (i, (id, ts)) in [(30u64, 100u64), (10, 200), (20, 300)].iter().enumerate() {
            let mut e = EventLogEntry::new(5, "boot", format!("event {id}"));
            e.id = *id;
            e.timestamp = *ts;
            entries.push(update_entry(i as u64 + 1, &e));
        }
        sm.update(entries).await.unwrap();

        let (asc, _) = decode_page::<EventLogEntry>(
            sm.lookup(Query::Page(PageQuery::new(1, 10, SortOrder::Asc))).await.unwrap(),
        );
        assert_eq!(asc.iter().map(|e| e.id).collect::<Vec<_>>(), vec![30, 10, 20]);

        let (desc, _) = decode_page::<EventLogEntry>(
            sm.lookup(Query::Page(PageQuery::new(1, 10, SortOrder::Desc))).await.unwrap(),
        );
        assert_eq!(desc.iter().map(|e| e.id).collect::<Vec<_>>(), vec![20, 10, 30]);

        // Deleting removes the index entry too.
        let mut gone = EventLogEntry::new(5, "boot", "event 10");
        gone.id = 10;
        gone.timestamp = 200;
        sm.update(vec![delete_entry(4, &gone)]).await.unwrap();
        let (after, _) = decode_page::<EventLogEntry>(
            sm.lookup(Query::Page(PageQuery::new(1, 10, SortOrder::Asc))).await.unwrap(),
        );
        assert_eq!(after.iter().map(|e| e.id).collect::<Vec<_>>(), vec![30, 20]);
        assert_eq!(sm.lookup(Query::Count).await.unwrap(), QueryResult::Count(2));
    }

    #[tokio::test]
    async fn time_series_records_without_a_timestamp_are_rejected() {
        let dir = TempDir::new().unwrap();
        let sm = TsStateMachine::<EventLogEntry>::new(2, dir.path());
        sm.open().await.unwrap();

        // Both records carry timestamp 0 and would collide on one index
        // key, the later one shadowing the earlier.
        let mut first = EventLogEntry::new(5, "boot", "first");
        first.id = 1;
        let mut second = EventLogEntry::new(5, "boot", "second");
        second.id = 2;

        let err = sm
            .update(vec![update_entry(1, &first), update_entry(2, &second)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingTimestamp(1)));
        assert_eq!(sm.lookup(Query::Count).await.unwrap(), QueryResult::Count(0));
    }

    #[tokio::test]
    async fn snapshot_round_trip_between_machines() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let src = TsStateMachine::<EventLogEntry>::new(3, src_dir.path());
        src.open().await.unwrap();

        let mut entries = Vec::new();
        for i in 1..=10u64 {
            let mut e = EventLogEntry::new(9, "tick", format!("n{i}"));
            e.id = i;
            e.timestamp = i * 1000;
            entries.push(update_entry(i, &e));
        }
        src.update(entries).await.unwrap();

        let handle = src.prepare_snapshot().await.unwrap();
        let mut stream = Vec::new();
        src.save_snapshot(handle, &mut stream, &CancellationToken::new()).await.unwrap();

        let dst = TsStateMachine::<EventLogEntry>::new(3, dst_dir.path());
        dst.open().await.unwrap();
        dst.recover_from_snapshot(&mut stream.as_slice()).await.unwrap();

        assert_eq!(dst.applied_index(), 10);
        assert_eq!(dst.lookup(Query::Count).await.unwrap(), QueryResult::Count(10));
        let (page, _) = decode_page::<EventLogEntry>(
            dst.lookup(Query::Page(PageQuery::new(1, 3, SortOrder::Desc))).await.unwrap(),
        );
        assert_eq!(page.iter().map(|e| e.id).collect::<Vec<_>>(), vec![10, 9, 8]);
    }
}
