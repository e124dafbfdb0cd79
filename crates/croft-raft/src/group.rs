//! One replication group on one node.
//!
//! A `ReplicaGroup` ties together the raft instance, its durable storage and
//! the state machine, and offers the host the operations it needs: propose
//! (with leader forwarding), linearizable and local lookups, readiness
//! waiting and shutdown.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{CheckIsLeaderError, ClientWriteError, InitializeError, RaftError};
use openraft::storage::Adaptor;
use tokio_util::sync::CancellationToken;

use croft_commons::error::{Error, Result};
use croft_commons::wire::{Query, QueryResult};

use crate::config::HostConfig;
use crate::log_store::RaftLogStore;
use crate::router::{ClusterRouter, RouterNetworkFactory};
use crate::state_machine::StateMachine;
use crate::storage::GroupStorage;
use crate::types::{NodeId, NodeInfo, Raft, TypeConfig};

const FORWARD_ATTEMPTS: u32 = 5;
const FORWARD_BACKOFF: Duration = Duration::from_millis(100);
const APPLY_POLL: Duration = Duration::from_millis(5);

pub struct ReplicaGroup {
    cluster_id: u64,
    node_id: NodeId,
    raft: Raft,
    storage: Arc<GroupStorage>,
    state_machine: Arc<dyn StateMachine>,
    router: Arc<ClusterRouter>,
    cancel: CancellationToken,
}

impl ReplicaGroup {
    /// Opens the state machine, the durable raft log and the raft instance,
    /// then registers the group with the router.
    pub(crate) async fn start(
        cluster_id: u64,
        node_id: NodeId,
        dir: &Path,
        state_machine: Arc<dyn StateMachine>,
        router: Arc<ClusterRouter>,
        config: &HostConfig,
    ) -> Result<Arc<Self>> {
        let applied = state_machine.open().await?;
        log::info!("group {cluster_id} on node {node_id}: state machine open at index {applied}");

        let log = RaftLogStore::open(dir.join("raft"))?;
        let cancel = CancellationToken::new();
        let storage = Arc::new(GroupStorage::new(
            cluster_id,
            log,
            state_machine.clone(),
            cancel.clone(),
        ));

        let raft_config = Arc::new(
            openraft::Config {
                cluster_name: format!("croft-group-{cluster_id}"),
                heartbeat_interval: config.heartbeat_interval_ms,
                election_timeout_min: config.election_timeout_min_ms,
                election_timeout_max: config.election_timeout_max_ms,
                ..Default::default()
            }
            .validate()
            .map_err(Error::raft)?,
        );

        let (log_store, sm_adapter) = Adaptor::new(storage.clone());
        let network = RouterNetworkFactory::new(cluster_id, router.clone());
        let raft = Raft::new(node_id, raft_config, network, log_store, sm_adapter)
            .await
            .map_err(Error::raft)?;

        let group = Arc::new(ReplicaGroup {
            cluster_id,
            node_id,
            raft,
            storage,
            state_machine,
            router: router.clone(),
            cancel,
        });
        router.register(cluster_id, node_id, group.clone());
        Ok(group)
    }

    pub fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub(crate) fn raft(&self) -> &Raft {
        &self.raft
    }

    pub(crate) fn state_machine(&self) -> &Arc<dyn StateMachine> {
        &self.state_machine
    }

    /// True once a membership config has been persisted for this group.
    pub fn is_initialized(&self) -> Result<bool> {
        self.storage.log().is_initialized()
    }

    /// Bootstraps the group with the given member set. Idempotent: a group
    /// that already has a persisted membership (fresh bootstrap race or a
    /// restart) reports success without touching the log.
    pub async fn initialize(&self, members: BTreeMap<NodeId, NodeInfo>) -> Result<()> {
        if self.is_initialized()? {
            return Ok(());
        }
        match self.raft.initialize(members).await {
            Ok(()) => Ok(()),
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => Ok(()),
            Err(e) => Err(Error::raft(e)),
        }
    }

    pub fn is_leader(&self) -> bool {
        let metrics = self.raft.metrics().borrow().clone();
        metrics.current_leader == Some(self.node_id)
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.raft.metrics().borrow().current_leader
    }

    /// Proposes locally; fails with `NotLeader` on a follower.
    pub async fn propose(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        match self.raft.client_write(payload).await {
            Ok(response) => Ok(response.data),
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(forward))) => {
                Err(Error::NotLeader { group: self.cluster_id, leader: forward.leader_id })
            }
            Err(e) => Err(Error::raft(e)),
        }
    }

    /// Proposes from any node, forwarding to the current leader through the
    /// router and retrying with backoff across leadership changes. Returns
    /// only after this node has applied the proposal, so an immediate local
    /// read on the issuing node observes it.
    pub async fn propose_forwarded(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        for attempt in 1..=FORWARD_ATTEMPTS {
            match self.leader_group() {
                Some(leader) => match leader.propose(payload.clone()).await {
                    Ok(response) => {
                        self.wait_locally_applied(&response).await?;
                        return Ok(response);
                    }
                    Err(e) if e.is_retryable() => {
                        log::debug!(
                            "group {}: propose attempt {attempt} bounced: {e}",
                            self.cluster_id
                        );
                    }
                    Err(e) => return Err(e),
                },
                None => {
                    log::debug!("group {}: no leader yet (attempt {attempt})", self.cluster_id);
                }
            }
            tokio::time::sleep(FORWARD_BACKOFF * attempt).await;
        }
        Err(Error::NotLeader { group: self.cluster_id, leader: self.current_leader() })
    }

    /// Linearizable lookup through this node's raft; leader only.
    pub async fn linearizable_lookup(&self, query: Query) -> Result<QueryResult> {
        match self.raft.ensure_linearizable().await {
            Ok(_) => {}
            Err(RaftError::APIError(CheckIsLeaderError::ForwardToLeader(forward))) => {
                return Err(Error::NotLeader {
                    group: self.cluster_id,
                    leader: forward.leader_id,
                })
            }
            Err(e) => return Err(Error::raft(e)),
        }
        self.state_machine.lookup(query).await
    }

    /// Linearizable lookup from any node: the read barrier and the lookup
    /// both run on the current leader.
    pub async fn lookup_forwarded(&self, query: Query) -> Result<QueryResult> {
        for attempt in 1..=FORWARD_ATTEMPTS {
            match self.leader_group() {
                Some(leader) => match leader.linearizable_lookup(query).await {
                    Ok(result) => return Ok(result),
                    Err(e) if e.is_retryable() => {
                        log::debug!(
                            "group {}: read attempt {attempt} bounced: {e}",
                            self.cluster_id
                        );
                    }
                    Err(e) => return Err(e),
                },
                None => {
                    log::debug!("group {}: no leader yet (attempt {attempt})", self.cluster_id);
                }
            }
            tokio::time::sleep(FORWARD_BACKOFF * attempt).await;
        }
        Err(Error::NotLeader { group: self.cluster_id, leader: self.current_leader() })
    }

    /// Lookup against locally applied state, no read barrier.
    pub async fn lookup_local(&self, query: Query) -> Result<QueryResult> {
        self.state_machine.lookup(query).await
    }

    /// Blocks until this node's state machine has applied the entry whose
    /// log index is echoed in a proposal response. The leader acknowledges
    /// a proposal once it has applied it itself; the issuing node may still
    /// be behind at that point.
    async fn wait_locally_applied(&self, response: &[u8]) -> Result<()> {
        let Ok(raw) = <[u8; 8]>::try_from(response) else {
            return Ok(());
        };
        let index = u64::from_le_bytes(raw);
        while self.state_machine.applied_index() < index {
            if self.cancel.is_cancelled() {
                return Err(Error::Shutdown);
            }
            tokio::time::sleep(APPLY_POLL).await;
        }
        Ok(())
    }

    /// Waits until the group observes an elected leader and this node's
    /// applied state has caught up with the leader's. A restarted or
    /// rejoining replica is not ready while it still lags.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        self.raft
            .wait(Some(timeout))
            .metrics(|m| m.current_leader.is_some(), "leader elected")
            .await
            .map_err(Error::raft)?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader_group() {
                let target = leader.storage.log().last_applied()?.map(|id| id.index);
                let local = self.storage.log().last_applied()?.map(|id| id.index);
                if local >= target {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(timeout));
            }
            tokio::time::sleep(APPLY_POLL).await;
        }
    }

    /// Stops raft, closes the state machine and leaves the router.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        self.router.unregister(self.cluster_id, self.node_id);
        self.raft.shutdown().await.map_err(Error::raft)?;
        self.state_machine.close().await?;
        log::info!("group {} on node {} shut down", self.cluster_id, self.node_id);
        Ok(())
    }

    fn leader_group(&self) -> Option<Arc<ReplicaGroup>> {
        let leader = self.current_leader()?;
        if leader == self.node_id {
            self.router.lookup(self.cluster_id, self.node_id)
        } else {
            self.router.lookup(self.cluster_id, leader)
        }
    }
}
