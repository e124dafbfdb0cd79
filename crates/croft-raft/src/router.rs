//! In-process transport between replication groups.
//!
//! Every node host hanging off one [`ClusterRouter`] can reach every other
//! node's groups directly: the openraft network factory resolves
//! `(cluster_id, target node)` to the live [`ReplicaGroup`] and calls into
//! its raft instance. A missing target reports `Unreachable`, which makes
//! openraft back off and retry, covering the window where peers register
//! during bootstrap.

use std::io;
use std::sync::Arc;

use dashmap::DashMap;
use openraft::error::{InstallSnapshotError, RPCError, RaftError, RemoteError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};

use crate::group::ReplicaGroup;
use crate::types::{NodeId, NodeInfo, TypeConfig};

/// Registry of live groups, keyed by `(cluster_id, node_id)`.
pub struct ClusterRouter {
    groups: DashMap<(u64, NodeId), Arc<ReplicaGroup>>,
}

impl ClusterRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(ClusterRouter { groups: DashMap::new() })
    }

    pub(crate) fn register(&self, cluster_id: u64, node_id: NodeId, group: Arc<ReplicaGroup>) {
        self.groups.insert((cluster_id, node_id), group);
    }

    pub(crate) fn unregister(&self, cluster_id: u64, node_id: NodeId) {
        self.groups.remove(&(cluster_id, node_id));
    }

    pub(crate) fn lookup(&self, cluster_id: u64, node_id: NodeId) -> Option<Arc<ReplicaGroup>> {
        self.groups.get(&(cluster_id, node_id)).map(|entry| entry.value().clone())
    }
}

/// Network factory handed to each raft instance at group start.
pub(crate) struct RouterNetworkFactory {
    cluster_id: u64,
    router: Arc<ClusterRouter>,
}

impl RouterNetworkFactory {
    pub(crate) fn new(cluster_id: u64, router: Arc<ClusterRouter>) -> Self {
        RouterNetworkFactory { cluster_id, router }
    }
}

impl RaftNetworkFactory<TypeConfig> for RouterNetworkFactory {
    type Network = RouterNetwork;

    async fn new_client(&mut self, target: NodeId, _node: &NodeInfo) -> Self::Network {
        RouterNetwork { cluster_id: self.cluster_id, target, router: self.router.clone() }
    }
}

/// One peer connection: RPCs delegated straight into the target's raft.
pub(crate) struct RouterNetwork {
    cluster_id: u64,
    target: NodeId,
    router: Arc<ClusterRouter>,
}

impl RouterNetwork {
    fn target_group<E: std::error::Error>(
        &self,
    ) -> Result<Arc<ReplicaGroup>, RPCError<NodeId, NodeInfo, E>> {
        self.router.lookup(self.cluster_id, self.target).ok_or_else(|| {
            let err = io::Error::new(
                io::ErrorKind::NotConnected,
                format!("group {} not registered on node {}", self.cluster_id, self.target),
            );
            RPCError::Unreachable(Unreachable::new(&err))
        })
    }
}

impl RaftNetwork<TypeConfig> for RouterNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, NodeInfo, RaftError<NodeId>>> {
        let group = self.target_group()?;
        group
            .raft()
            .append_entries(rpc)
            .await
            .map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, NodeInfo, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let group = self.target_group()?;
        group
            .raft()
            .install_snapshot(rpc)
            .await
            .map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, NodeInfo, RaftError<NodeId>>> {
        let group = self.target_group()?;
        group
            .raft()
            .vote(rpc)
            .await
            .map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }
}
