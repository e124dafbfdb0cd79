//! Typed gateway over the node host.
//!
//! A [`Repository`] binds an entity type to a replication group and turns
//! CRUD, pagination and counting into proposals and queries. A
//! [`CurrentState`] does the same for single-value concurrent groups.

use std::marker::PhantomData;
use std::sync::Arc;

use tokio::sync::watch;

use croft_commons::entity::{from_payload, to_payload, KeyValueEntity, TimeSeriesEntity};
use croft_commons::error::{Error, Result};
use croft_commons::ids;
use croft_commons::wire::{Consistency, PageQuery, Proposal, Query, QueryResult};

use crate::bootstrap::TableSpec;
use crate::host::NodeHost;
use crate::state_machine::CurrentStateMachine;

/// One page of typed entities.
#[derive(Debug, Clone)]
pub struct PageResult<E> {
    pub page: u64,
    pub page_size: u64,
    pub entities: Vec<E>,
    pub has_more: bool,
}

/// Typed access to one replication group.
pub struct Repository<E: KeyValueEntity> {
    cluster_id: u64,
    host: Arc<NodeHost>,
    content_ids: Option<Arc<dyn Fn(&E) -> u64 + Send + Sync>>,
}

impl<E: KeyValueEntity> Clone for Repository<E> {
    fn clone(&self) -> Self {
        Repository {
            cluster_id: self.cluster_id,
            host: self.host.clone(),
            content_ids: self.content_ids.clone(),
        }
    }
}

impl<E: KeyValueEntity> Repository<E> {
    pub fn new(cluster_id: u64, host: Arc<NodeHost>) -> Self {
        Repository { cluster_id, host, content_ids: None }
    }

    /// Installs a deterministic id function used for entities saved with a
    /// zero id, instead of the default clock-assigned id. Lets natural-key
    /// records (e.g. a customer keyed by email) be fetched without a
    /// secondary index.
    pub fn with_content_ids(
        mut self,
        f: impl Fn(&E) -> u64 + Send + Sync + 'static,
    ) -> Self {
        self.content_ids = Some(Arc::new(f));
        self
    }

    pub fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    /// Starts this repository's replication group on its host using the
    /// table registry's factory, then optionally blocks until the group is
    /// ready. `spec` must be the registry entry for this repository's
    /// table; an already-running group is left alone.
    pub async fn start_cluster_node(
        &self,
        spec: &TableSpec,
        join: bool,
        wait_ready: bool,
    ) -> Result<()> {
        if !self.host.has_group(self.cluster_id) {
            self.host
                .create_on_disk_group(self.cluster_id, join, |ctx| spec.build(ctx))
                .await?;
        }
        if wait_ready {
            self.host.wait_for_cluster_ready(self.cluster_id).await?;
        }
        Ok(())
    }

    fn assign_id(&self, entity: &mut E) {
        if entity.identifier() != 0 {
            return;
        }
        let id = match &self.content_ids {
            Some(f) => f(entity),
            None => ids::next_micros(),
        };
        entity.set_identifier(id);
    }

    async fn propose(&self, proposal: Proposal) -> Result<()> {
        self.host.sync_propose(self.cluster_id, proposal.encode()?).await
    }

    async fn query(&self, query: Query, consistency: Consistency) -> Result<QueryResult> {
        match consistency {
            Consistency::Quorum => self.host.sync_read(self.cluster_id, query).await,
            Consistency::Local => self.host.read_local(self.cluster_id, query).await,
        }
    }

    /// Saves the entity, assigning an id first when it has none.
    ///
    /// Time-series records go through
    /// [`Repository::save_with_time_series_index`] instead, which stamps
    /// the timestamp the index key derives from; a time-series state
    /// machine rejects proposals without one.
    pub async fn save(&self, entity: &mut E) -> Result<()> {
        self.assign_id(entity);
        self.propose(Proposal::update(to_payload(entity)?)).await
    }

    /// Overwrites an existing entity.
    pub async fn update(&self, entity: &E) -> Result<()> {
        self.propose(Proposal::update(to_payload(entity)?)).await
    }

    /// Deletes the entity (and, for time-series records, its index entry).
    pub async fn delete(&self, entity: &E) -> Result<()> {
        self.propose(Proposal::delete(to_payload(entity)?)).await
    }

    pub async fn get(&self, id: u64, consistency: Consistency) -> Result<E> {
        match self.query(Query::Get(id), consistency).await? {
            QueryResult::Value(Some(bytes)) => from_payload(&bytes),
            QueryResult::Value(None) => Err(Error::NotFound),
            other => Err(Error::UnsupportedQuery(format!("expected a value, got {other:?}"))),
        }
    }

    pub async fn get_page(
        &self,
        query: PageQuery,
        consistency: Consistency,
    ) -> Result<PageResult<E>> {
        match self.query(Query::Page(query), consistency).await? {
            QueryResult::Page(raw) => {
                let mut entities = Vec::with_capacity(raw.entities.len());
                for bytes in &raw.entities {
                    entities.push(from_payload(bytes)?);
                }
                Ok(PageResult {
                    page: query.page.max(1),
                    page_size: query.page_size,
                    entities,
                    has_more: raw.has_more,
                })
            }
            other => Err(Error::UnsupportedQuery(format!("expected a page, got {other:?}"))),
        }
    }

    /// Walks pages starting from `query`, invoking `visit` per page, until
    /// the last page or the first callback error.
    pub async fn for_each_page<F>(
        &self,
        query: PageQuery,
        consistency: Consistency,
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(&PageResult<E>) -> Result<()>,
    {
        let mut current = PageQuery { page: query.page.max(1), ..query };
        loop {
            let page = self.get_page(current, consistency).await?;
            let has_more = page.has_more;
            visit(&page)?;
            if !has_more {
                return Ok(());
            }
            current.page += 1;
        }
    }

    /// Number of live entities. Linear in the group's size.
    pub async fn count(&self, consistency: Consistency) -> Result<u64> {
        match self.query(Query::Count, consistency).await? {
            QueryResult::Count(n) => Ok(n),
            other => Err(Error::UnsupportedQuery(format!("expected a count, got {other:?}"))),
        }
    }
}

impl<E: TimeSeriesEntity> Repository<E> {
    /// Saves a time-series record: stamps it with the monotonic clock so
    /// index keys are unique, then proposes. A zero id is replaced by the
    /// timestamp (or the installed content-id function).
    pub async fn save_with_time_series_index(&self, entity: &mut E) -> Result<()> {
        entity.set_timestamp(ids::next_micros());
        if entity.identifier() == 0 {
            match &self.content_ids {
                Some(f) => {
                    let id = f(entity);
                    entity.set_identifier(id);
                }
                None => entity.set_identifier(entity.timestamp()),
            }
        }
        self.propose(Proposal::update(to_payload(entity)?)).await
    }
}

/// Typed client for a concurrent (single current value) group.
pub struct CurrentState<E: KeyValueEntity> {
    cluster_id: u64,
    host: Arc<NodeHost>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: KeyValueEntity> CurrentState<E> {
    pub fn new(cluster_id: u64, host: Arc<NodeHost>) -> Self {
        CurrentState { cluster_id, host, _entity: PhantomData }
    }

    /// Replaces the group's current value.
    pub async fn publish(&self, entity: &E) -> Result<()> {
        let proposal = Proposal::update(to_payload(entity)?);
        self.host.sync_propose(self.cluster_id, proposal.encode()?).await
    }

    /// Clears the group's current value.
    pub async fn clear(&self) -> Result<()> {
        let proposal = Proposal::delete(Vec::new());
        self.host.sync_propose(self.cluster_id, proposal.encode()?).await
    }

    /// The current value, or `None` when nothing has been published.
    pub async fn current(&self, consistency: Consistency) -> Result<Option<E>> {
        let result = match consistency {
            Consistency::Quorum => self.host.sync_read(self.cluster_id, Query::Get(0)).await?,
            Consistency::Local => self.host.read_local(self.cluster_id, Query::Get(0)).await?,
        };
        match result {
            QueryResult::Value(Some(bytes)) => Ok(Some(from_payload(&bytes)?)),
            QueryResult::Value(None) => Ok(None),
            other => Err(Error::UnsupportedQuery(format!("expected a value, got {other:?}"))),
        }
    }

    /// Subscribes to value changes applied on this node. Payloads are raw;
    /// decode with [`CurrentState::decode`].
    pub fn subscribe(&self) -> Result<watch::Receiver<Option<Vec<u8>>>> {
        let group = self.host.group(self.cluster_id)?;
        let sm = group.state_machine().clone();
        let current = sm
            .as_any()
            .downcast_ref::<CurrentStateMachine>()
            .ok_or_else(|| {
                Error::UnsupportedQuery(format!(
                    "group {} is not a concurrent state group",
                    self.cluster_id
                ))
            })?;
        Ok(current.subscribe())
    }

    pub fn decode(bytes: &[u8]) -> Result<E> {
        from_payload(bytes)
    }
}
