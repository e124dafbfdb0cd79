//! Multi-group Raft for croft.
//!
//! One process runs a [`host::NodeHost`] that owns any number of
//! replication groups; each group pairs a raft instance with a state
//! machine (on-disk keyed, on-disk time-series, or in-memory current
//! value). Clients go through the typed [`gateway::Repository`] /
//! [`gateway::CurrentState`] and never touch consensus directly.

pub mod bootstrap;
pub mod config;
pub mod gateway;
pub mod group;
pub mod host;
pub mod log_store;
pub mod router;
pub mod state_machine;
pub mod storage;
pub mod telemetry;
pub mod types;

pub use bootstrap::{default_tables, start_tables, LocalCluster, TableSpec};
pub use config::HostConfig;
pub use gateway::{CurrentState, PageResult, Repository};
pub use host::{GroupContext, NodeHost};
pub use router::ClusterRouter;
pub use state_machine::{
    CurrentStateMachine, KvStateMachine, StateMachine, TsStateMachine,
};
pub use telemetry::DeviceTelemetry;
pub use types::{NodeId, NodeInfo, TypeConfig};
