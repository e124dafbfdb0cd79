//! Node host configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{NodeId, NodeInfo};

/// Configuration for one [`crate::host::NodeHost`].
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// This node's id within every group it hosts.
    pub node_id: NodeId,

    /// Root directory; each group stores under `<data_root>/<cluster_id>/`.
    pub data_root: PathBuf,

    /// The full member set used when bootstrapping a fresh group.
    pub initial_members: BTreeMap<NodeId, NodeInfo>,

    /// Deadline applied to `sync_propose` / `sync_read`.
    pub default_timeout: Duration,

    /// Deadline for `wait_for_cluster_ready`.
    pub ready_timeout: Duration,

    /// Raft tick tuning, in milliseconds.
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
}

impl HostConfig {
    /// A single-node configuration rooted at `data_root`; the member set
    /// defaults to just this node.
    pub fn new(node_id: NodeId, data_root: impl Into<PathBuf>) -> Self {
        let mut initial_members = BTreeMap::new();
        initial_members.insert(node_id, NodeInfo::new(format!("node-{node_id}")));
        HostConfig {
            node_id,
            data_root: data_root.into(),
            initial_members,
            default_timeout: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(30),
            heartbeat_interval_ms: 50,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
        }
    }

    pub fn with_members(mut self, members: BTreeMap<NodeId, NodeInfo>) -> Self {
        self.initial_members = members;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}
