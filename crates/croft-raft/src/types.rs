//! openraft type configuration for croft groups.
//!
//! Application data and responses are raw bytes: proposals are
//! bincode-framed [`croft_commons::Proposal`]s and responses carry the
//! applied log index. Keeping the consensus layer byte-oriented lets one
//! `Raft` type serve every state-machine flavor.

use std::io::Cursor;

use serde::{Deserialize, Serialize};

/// Node identifiers are plain integers, unique within a cluster.
pub type NodeId = u64;

/// Metadata stored in the membership config for each node. Transport is
/// resolved through the in-process router, so a display label is all a
/// node needs to carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
}

impl NodeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        NodeInfo { name: name.into() }
    }
}

impl std::fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// The croft openraft type configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeConfig;

impl openraft::RaftTypeConfig for TypeConfig {
    type D = Vec<u8>;
    type R = Vec<u8>;
    type NodeId = NodeId;
    type Node = NodeInfo;
    type Entry = openraft::Entry<TypeConfig>;
    type SnapshotData = Cursor<Vec<u8>>;
    type AsyncRuntime = openraft::TokioRuntime;
    type Responder = openraft::impls::OneshotResponder<TypeConfig>;
}

/// A raft instance for one replication group.
pub type Raft = openraft::Raft<TypeConfig>;
