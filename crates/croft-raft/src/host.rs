//! The node host: one process's window onto all of its replication groups.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::time::timeout;

use croft_commons::error::{Error, Result};
use croft_commons::wire::{Query, QueryResult};

use crate::config::HostConfig;
use crate::group::ReplicaGroup;
use crate::router::ClusterRouter;
use crate::state_machine::{CurrentStateMachine, StateMachine};
use crate::types::NodeId;

/// What a state-machine factory gets to work with: the group's identity and
/// its private data directory.
#[derive(Debug, Clone)]
pub struct GroupContext {
    pub cluster_id: u64,
    pub node_id: NodeId,
    pub dir: PathBuf,
}

/// Owns every replication group hosted by this node.
pub struct NodeHost {
    config: HostConfig,
    router: Arc<ClusterRouter>,
    groups: DashMap<u64, Arc<ReplicaGroup>>,
    stopped: AtomicBool,
}

impl NodeHost {
    pub fn new(config: HostConfig, router: Arc<ClusterRouter>) -> Arc<Self> {
        Arc::new(NodeHost { config, router, groups: DashMap::new(), stopped: AtomicBool::new(false) })
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn has_group(&self, cluster_id: u64) -> bool {
        self.groups.contains_key(&cluster_id)
    }

    pub(crate) fn group(&self, cluster_id: u64) -> Result<Arc<ReplicaGroup>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        self.groups
            .get(&cluster_id)
            .map(|entry| entry.value().clone())
            .ok_or(Error::GroupNotFound(cluster_id))
    }

    /// Starts a replication group whose state machine persists its own data
    /// under `<data_root>/<cluster_id>/`. With `join = false` the group is
    /// bootstrapped with the host's configured member set; with `join = true`
    /// it waits to be initialized elsewhere (or recovers a persisted
    /// membership on restart).
    pub async fn create_on_disk_group<F>(
        &self,
        cluster_id: u64,
        join: bool,
        factory: F,
    ) -> Result<()>
    where
        F: FnOnce(GroupContext) -> Result<Arc<dyn StateMachine>>,
    {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        if self.has_group(cluster_id) {
            return Err(Error::raft(format!(
                "group {cluster_id} already started on node {}",
                self.config.node_id
            )));
        }
        let dir = self.config.data_root.join(cluster_id.to_string());
        let context =
            GroupContext { cluster_id, node_id: self.config.node_id, dir: dir.clone() };
        let state_machine = factory(context)?;
        let group = ReplicaGroup::start(
            cluster_id,
            self.config.node_id,
            &dir,
            state_machine,
            self.router.clone(),
            &self.config,
        )
        .await?;
        if !join {
            group.initialize(self.config.initial_members.clone()).await?;
        }
        self.groups.insert(cluster_id, group);
        Ok(())
    }

    /// Starts a group backed by an in-memory [`CurrentStateMachine`]: a
    /// single replicated value with change subscriptions, no persistence
    /// promise beyond what raft snapshots provide.
    pub async fn create_concurrent_group(&self, cluster_id: u64, join: bool) -> Result<()> {
        self.create_on_disk_group(cluster_id, join, |ctx| {
            Ok(Arc::new(CurrentStateMachine::new(ctx.cluster_id)))
        })
        .await
    }

    /// Starts a group with a caller-provided state machine. The replication
    /// path is identical to [`NodeHost::create_on_disk_group`]; croft state
    /// machines own their durability either way.
    pub async fn create_regular_group<F>(
        &self,
        cluster_id: u64,
        join: bool,
        factory: F,
    ) -> Result<()>
    where
        F: FnOnce(GroupContext) -> Result<Arc<dyn StateMachine>>,
    {
        self.create_on_disk_group(cluster_id, join, factory).await
    }

    /// Bootstraps a group with the host's configured member set. Idempotent
    /// against persisted membership; used when groups are created with
    /// `join = true` on every node and initialized from one.
    pub async fn initialize_group(&self, cluster_id: u64) -> Result<()> {
        self.group(cluster_id)?.initialize(self.config.initial_members.clone()).await
    }

    /// Proposes a payload through consensus, forwarding to the leader when
    /// necessary, and returns only after this node has applied it. On
    /// `Timeout` the proposal may still commit later.
    pub async fn sync_propose(&self, cluster_id: u64, payload: Vec<u8>) -> Result<()> {
        let group = self.group(cluster_id)?;
        let deadline = self.config.default_timeout;
        timeout(deadline, group.propose_forwarded(payload))
            .await
            .map_err(|_| Error::Timeout(deadline))??;
        Ok(())
    }

    /// Linearizable read: observes every proposal acknowledged before it.
    pub async fn sync_read(&self, cluster_id: u64, query: Query) -> Result<QueryResult> {
        let group = self.group(cluster_id)?;
        let deadline = self.config.default_timeout;
        timeout(deadline, group.lookup_forwarded(query))
            .await
            .map_err(|_| Error::Timeout(deadline))?
    }

    /// Read against locally applied state; may lag the leader.
    pub async fn read_local(&self, cluster_id: u64, query: Query) -> Result<QueryResult> {
        self.group(cluster_id)?.lookup_local(query).await
    }

    /// Blocks until the group has an elected leader and this node has
    /// caught up with the leader's applied state.
    pub async fn wait_for_cluster_ready(&self, cluster_id: u64) -> Result<()> {
        let group = self.group(cluster_id)?;
        group.wait_ready(self.config.ready_timeout).await
    }

    /// Stops one group and removes it from the host.
    pub async fn stop_group(&self, cluster_id: u64) -> Result<()> {
        let (_, group) =
            self.groups.remove(&cluster_id).ok_or(Error::GroupNotFound(cluster_id))?;
        group.shutdown().await
    }

    /// Stops every group. The host accepts no requests afterwards.
    pub async fn shutdown(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let ids: Vec<u64> = self.groups.iter().map(|entry| *entry.key()).collect();
        for cluster_id in ids {
            if let Some((_, group)) = self.groups.remove(&cluster_id) {
                if let Err(e) = group.shutdown().await {
                    log::warn!("group {cluster_id} shutdown failed: {e}");
                }
            }
        }
        log::info!("node host {} shut down", self.config.node_id);
        Ok(())
    }
}
