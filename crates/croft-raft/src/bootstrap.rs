//! Group lifecycle: the table registry and the local test cluster.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use croft_commons::entity::{KeyValueEntity, TimeSeriesEntity};
use croft_commons::error::{Error, Result};
use croft_commons::models::{Algorithm, Customer, Role};
use croft_commons::tables;

use crate::config::HostConfig;
use crate::host::{GroupContext, NodeHost};
use crate::router::ClusterRouter;
use crate::state_machine::{CurrentStateMachine, KvStateMachine, StateMachine, TsStateMachine};
use crate::types::{NodeId, NodeInfo};

type Factory = Arc<dyn Fn(GroupContext) -> Result<Arc<dyn StateMachine>> + Send + Sync>;

/// One named table: a cluster id plus the factory that builds its state
/// machine on each node.
#[derive(Clone)]
pub struct TableSpec {
    pub cluster_id: u64,
    pub name: &'static str,
    factory: Factory,
}

impl TableSpec {
    /// A plain keyed table.
    pub fn key_value<E: KeyValueEntity>(cluster_id: u64, name: &'static str) -> Self {
        TableSpec {
            cluster_id,
            name,
            factory: Arc::new(|ctx| {
                Ok(Arc::new(KvStateMachine::<E>::new(ctx.cluster_id, ctx.dir)))
            }),
        }
    }

    /// A table with the timestamp index maintained on every write.
    pub fn time_series<E: TimeSeriesEntity>(cluster_id: u64, name: &'static str) -> Self {
        TableSpec {
            cluster_id,
            name,
            factory: Arc::new(|ctx| {
                Ok(Arc::new(TsStateMachine::<E>::new(ctx.cluster_id, ctx.dir)))
            }),
        }
    }

    /// A single-value concurrent group.
    pub fn current_state(cluster_id: u64, name: &'static str) -> Self {
        TableSpec {
            cluster_id,
            name,
            factory: Arc::new(|ctx| Ok(Arc::new(CurrentStateMachine::new(ctx.cluster_id)))),
        }
    }

    pub(crate) fn build(&self, context: GroupContext) -> Result<Arc<dyn StateMachine>> {
        (self.factory)(context)
    }
}

/// The statically registered tables.
pub fn default_tables() -> Vec<TableSpec> {
    vec![
        TableSpec::key_value::<Customer>(tables::CUSTOMERS, "customers"),
        TableSpec::key_value::<Role>(tables::ROLES, "roles"),
        TableSpec::key_value::<Algorithm>(tables::ALGORITHMS, "algorithms"),
    ]
}

/// Starts every listed table on `host`. With `join = false` each group is
/// bootstrapped from the host's member set as it starts; multi-node setups
/// start with `join = true` everywhere and initialize from one node.
pub async fn start_tables(
    host: &Arc<NodeHost>,
    specs: &[TableSpec],
    join: bool,
    wait_ready: bool,
) -> Result<()> {
    for spec in specs {
        if host.has_group(spec.cluster_id) {
            continue;
        }
        log::info!("starting table {} (group {})", spec.name, spec.cluster_id);
        host.create_on_disk_group(spec.cluster_id, join, |ctx| spec.build(ctx)).await?;
    }
    if wait_ready {
        for spec in specs {
            host.wait_for_cluster_ready(spec.cluster_id).await?;
        }
    }
    Ok(())
}

/// An in-process cluster of `n` node hosts sharing one router, for tests
/// and local development.
///
/// Every group is created on every node with `join = true`, then
/// initialized from node 1; on a restart over existing directories the
/// initialization is a no-op because membership is already persisted.
pub struct LocalCluster {
    router: Arc<ClusterRouter>,
    hosts: Vec<Arc<NodeHost>>,
}

impl LocalCluster {
    /// Starts (or restarts) a cluster rooted at `base`, with every table in
    /// `specs` running and ready.
    pub async fn start(n: usize, base: &Path, specs: &[TableSpec]) -> Result<Self> {
        if n == 0 {
            return Err(Error::raft("a cluster needs at least one node"));
        }
        let members: BTreeMap<NodeId, NodeInfo> = (1..=n as u64)
            .map(|id| (id, NodeInfo::new(format!("node-{id}"))))
            .collect();

        let router = ClusterRouter::new();
        let mut hosts = Vec::with_capacity(n);
        for id in members.keys() {
            let config = HostConfig::new(*id, base.join(format!("node-{id}")))
                .with_members(members.clone());
            hosts.push(NodeHost::new(config, router.clone()));
        }

        let cluster = LocalCluster { router, hosts };
        for spec in specs {
            cluster.start_group(spec).await?;
        }
        Ok(cluster)
    }

    /// Creates one group on every node, initializes it from node 1 and
    /// waits for a leader everywhere.
    pub async fn start_group(&self, spec: &TableSpec) -> Result<()> {
        for host in &self.hosts {
            if !host.has_group(spec.cluster_id) {
                host.create_on_disk_group(spec.cluster_id, true, |ctx| spec.build(ctx)).await?;
            }
        }
        self.hosts[0].initialize_group(spec.cluster_id).await?;
        for host in &self.hosts {
            host.wait_for_cluster_ready(spec.cluster_id).await?;
        }
        Ok(())
    }

    /// Starts a telemetry group for `device_id` on every node and returns
    /// its cluster id.
    pub async fn start_telemetry_group(&self, device_id: u64) -> Result<u64> {
        use crate::telemetry::DeviceTelemetry;
        let mut cluster_id = 0;
        for host in &self.hosts {
            cluster_id = DeviceTelemetry::new(host.clone()).ensure_group(device_id, true).await?;
        }
        self.hosts[0].initialize_group(cluster_id).await?;
        for host in &self.hosts {
            host.wait_for_cluster_ready(cluster_id).await?;
        }
        Ok(cluster_id)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// The `i`-th host, zero-based.
    pub fn host(&self, i: usize) -> &Arc<NodeHost> {
        &self.hosts[i]
    }

    pub fn hosts(&self) -> &[Arc<NodeHost>] {
        &self.hosts
    }

    pub fn router(&self) -> Arc<ClusterRouter> {
        self.router.clone()
    }

    /// Shuts every host down. Data directories stay behind, so a new
    /// `start` over the same base resumes where this cluster left off.
    pub async fn shutdown(&self) -> Result<()> {
        for host in &self.hosts {
            host.shutdown().await?;
        }
        Ok(())
    }
}
