//! End-to-end tests over an in-process multi-node cluster.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use croft_commons::models::{Algorithm, Customer, DeviceState, EventLogEntry, FarmState, Role};
use croft_commons::tables;
use croft_commons::wire::{Consistency, PageQuery, SortOrder};
use croft_commons::Error;
use croft_raft::{
    CurrentState, DeviceTelemetry, KvStateMachine, LocalCluster, Repository, StateMachine,
    TableSpec,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[tokio::test(flavor = "multi_thread")]
async fn role_written_on_one_node_is_readable_on_all() {
    init_logging();
    let base = TempDir::new().unwrap();
    let specs = vec![TableSpec::key_value::<Role>(tables::ROLES, "roles")];
    let cluster = LocalCluster::start(3, base.path(), &specs).await.unwrap();

    // Propose through a host that may well be a follower.
    let repo = Repository::<Role>::new(tables::ROLES, cluster.host(1).clone());
    let mut role = Role::new(0, "Admin");
    repo.save(&mut role).await.unwrap();
    assert_ne!(role.id, 0);

    for host in cluster.hosts() {
        let read = Repository::<Role>::new(tables::ROLES, host.clone());
        let fetched = read.get(role.id, Consistency::Quorum).await.unwrap();
        assert_eq!(fetched, role);
    }

    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn saves_are_locally_visible_on_the_issuing_node() {
    init_logging();
    let base = TempDir::new().unwrap();
    let specs = vec![TableSpec::key_value::<Role>(tables::ROLES, "roles")];
    let cluster = LocalCluster::start(3, base.path(), &specs).await.unwrap();

    // Followers forward to the leader, but a save must not return before
    // the issuing node itself has applied the entry: an immediate local
    // read on the same host has to observe it.
    for (i, host) in cluster.hosts().iter().enumerate() {
        let repo = Repository::<Role>::new(tables::ROLES, host.clone());
        let mut role = Role::new(50 + i as u64, format!("writer-{i}"));
        repo.save(&mut role).await.unwrap();
        let local = repo.get(role.id, Consistency::Local).await.unwrap();
        assert_eq!(local, role);
    }

    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn ready_wait_covers_a_rejoining_replica_catching_up() {
    init_logging();
    let base = TempDir::new().unwrap();
    let specs = vec![TableSpec::key_value::<Role>(tables::ROLES, "roles")];
    let cluster = LocalCluster::start(3, base.path(), &specs).await.unwrap();

    let repo = Repository::<Role>::new(tables::ROLES, cluster.host(0).clone());
    for i in 1..=5u64 {
        let mut role = Role::new(i, format!("early-{i}"));
        repo.save(&mut role).await.unwrap();
    }

    // Take one replica offline and keep writing without it.
    cluster.host(2).stop_group(tables::ROLES).await.unwrap();
    for i in 6..=15u64 {
        let mut role = Role::new(i, format!("late-{i}"));
        repo.save(&mut role).await.unwrap();
    }

    // Rejoin over the persisted directory. Readiness must mean caught up,
    // so a local read straight afterwards sees every committed record.
    cluster
        .host(2)
        .create_on_disk_group(tables::ROLES, true, |ctx| {
            Ok(Arc::new(KvStateMachine::<Role>::new(ctx.cluster_id, ctx.dir))
                as Arc<dyn StateMachine>)
        })
        .await
        .unwrap();
    cluster.host(2).wait_for_cluster_ready(tables::ROLES).await.unwrap();

    let rejoined = Repository::<Role>::new(tables::ROLES, cluster.host(2).clone());
    assert_eq!(rejoined.count(Consistency::Local).await.unwrap(), 15);

    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn repository_starts_its_own_group_from_the_registry() {
    init_logging();
    let base = TempDir::new().unwrap();
    let cluster = LocalCluster::start(1, base.path(), &[]).await.unwrap();

    let spec = TableSpec::key_value::<Role>(tables::ROLES, "roles");
    let repo = Repository::<Role>::new(tables::ROLES, cluster.host(0).clone());
    repo.start_cluster_node(&spec, false, true).await.unwrap();

    let mut role = Role::new(3, "bootstrapped");
    repo.save(&mut role).await.unwrap();
    assert_eq!(repo.get(3, Consistency::Quorum).await.unwrap().name, "bootstrapped");

    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn pagination_visits_every_algorithm_exactly_once() {
    init_logging();
    let base = TempDir::new().unwrap();
    let specs = vec![TableSpec::key_value::<Algorithm>(tables::ALGORITHMS, "algorithms")];
    let cluster = LocalCluster::start(3, base.path(), &specs).await.unwrap();

    let repo = Repository::<Algorithm>::new(tables::ALGORITHMS, cluster.host(0).clone());
    for i in 1..=100u64 {
        let mut algorithm = Algorithm::new(0, format!("Test Algorithm {i}"));
        repo.save(&mut algorithm).await.unwrap();
    }
    assert_eq!(repo.count(Consistency::Quorum).await.unwrap(), 100);

    let mut names = Vec::new();
    let mut pages = 0;
    repo.for_each_page(
        PageQuery::new(1, 10, SortOrder::Asc),
        Consistency::Quorum,
        |page| {
            pages += 1;
            assert!(page.entities.len() <= 10);
            names.extend(page.entities.iter().map(|a| a.name.clone()));
            Ok(())
        },
    )
    .await
    .unwrap();

    assert_eq!(pages, 10);
    assert_eq!(names.len(), 100);
    names.sort();
    names.dedup();
    assert_eq!(names.len(), 100, "every record seen exactly once");

    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn event_log_pages_in_both_time_orders() {
    init_logging();
    let base = TempDir::new().unwrap();
    let farm_id = 77u64;
    let group_id = croft_commons::ids::event_log_group_id(farm_id);
    let specs = vec![TableSpec::time_series::<EventLogEntry>(group_id, "event-log")];
    let cluster = LocalCluster::start(3, base.path(), &specs).await.unwrap();

    let repo = Repository::<EventLogEntry>::new(group_id, cluster.host(0).clone());
    for i in 1..=5u64 {
        let mut entry = EventLogEntry::new(farm_id, "pump", format!("event {i}"));
        repo.save_with_time_series_index(&mut entry).await.unwrap();
    }

    let asc = repo
        .get_page(PageQuery::new(1, 10, SortOrder::Asc), Consistency::Quorum)
        .await
        .unwrap();
    assert_eq!(asc.entities.len(), 5);
    let messages: Vec<_> = asc.entities.iter().map(|e| e.message.clone()).collect();
    assert_eq!(messages, vec!["event 1", "event 2", "event 3", "event 4", "event 5"]);
    assert!(asc.entities.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

    let desc = repo
        .get_page(PageQuery::new(1, 10, SortOrder::Desc), Consistency::Quorum)
        .await
        .unwrap();
    let reversed: Vec<_> = desc.entities.iter().map(|e| e.message.clone()).collect();
    assert_eq!(reversed, vec!["event 5", "event 4", "event 3", "event 2", "event 1"]);

    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn customer_lookup_by_email_and_delete() {
    init_logging();
    let base = TempDir::new().unwrap();
    let specs = vec![TableSpec::key_value::<Customer>(tables::CUSTOMERS, "customers")];
    let cluster = LocalCluster::start(3, base.path(), &specs).await.unwrap();

    let repo = Repository::<Customer>::new(tables::CUSTOMERS, cluster.host(0).clone())
        .with_content_ids(|c: &Customer| Customer::id_for_email(&c.email));

    let mut customer = Customer::new("grower@example.com", "Grower");
    customer.id = 0; // force the repository to assign it
    repo.save(&mut customer).await.unwrap();
    assert_eq!(customer.id, Customer::id_for_email("grower@example.com"));

    // Any node can resolve the email without a secondary index.
    let lookup = Repository::<Customer>::new(tables::CUSTOMERS, cluster.host(2).clone());
    let found = lookup
        .get(Customer::id_for_email("grower@example.com"), Consistency::Quorum)
        .await
        .unwrap();
    assert_eq!(found.name, "Grower");

    repo.delete(&found).await.unwrap();
    let err = lookup.get(found.id, Consistency::Quorum).await.unwrap_err();
    assert!(matches!(err, Error::NotFound));

    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn telemetry_streams_are_isolated_per_device() {
    init_logging();
    let base = TempDir::new().unwrap();
    let cluster = LocalCluster::start(3, base.path(), &[]).await.unwrap();

    cluster.start_telemetry_group(42).await.unwrap();
    cluster.start_telemetry_group(43).await.unwrap();

    let telemetry = DeviceTelemetry::new(cluster.host(0).clone());
    let mut first = DeviceState::new(42)
        .with_metric("metric1", 12.34)
        .with_metric("metric2", 56.78);
    telemetry.record(42, &mut first).await.unwrap();
    let mut second = DeviceState::new(42).with_metric("metric2", 99.9);
    telemetry.record(42, &mut second).await.unwrap();

    let history = telemetry
        .metric_history(42, "metric1", Consistency::Quorum)
        .await
        .unwrap();
    assert_eq!(history, vec![12.34]);

    let metric2 = telemetry
        .metric_history(42, "metric2", Consistency::Quorum)
        .await
        .unwrap();
    assert_eq!(metric2, vec![99.9, 56.78], "newest first");

    let err = telemetry
        .metric_history(42, "nonexistent", Consistency::Quorum)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MetricKeyNotFound(_)));

    // Device 43 never saw a sample.
    let other = telemetry.repository(43);
    assert_eq!(other.count(Consistency::Quorum).await.unwrap(), 0);

    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_preserves_every_committed_record() {
    init_logging();
    let base = TempDir::new().unwrap();
    let specs = vec![TableSpec::key_value::<Role>(tables::ROLES, "roles")];

    {
        let cluster = LocalCluster::start(1, base.path(), &specs).await.unwrap();
        let repo = Repository::<Role>::new(tables::ROLES, cluster.host(0).clone());
        for i in 1..=25u64 {
            let mut role = Role::new(i, format!("role-{i}"));
            repo.save(&mut role).await.unwrap();
        }
        assert_eq!(repo.count(Consistency::Quorum).await.unwrap(), 25);
        cluster.shutdown().await.unwrap();
    }

    // Same directories, fresh process state: the raft log replays into the
    // state machine behind its applied-index gate.
    let cluster = LocalCluster::start(1, base.path(), &specs).await.unwrap();
    let repo = Repository::<Role>::new(tables::ROLES, cluster.host(0).clone());
    assert_eq!(repo.count(Consistency::Quorum).await.unwrap(), 25);
    let seventh = repo.get(7, Consistency::Quorum).await.unwrap();
    assert_eq!(seventh.name, "role-7");

    // No duplicates, and the group keeps accepting writes.
    let mut extra = Role::new(26, "role-26");
    repo.save(&mut extra).await.unwrap();
    assert_eq!(repo.count(Consistency::Quorum).await.unwrap(), 26);

    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn current_state_publishes_to_subscribers_on_every_node() {
    init_logging();
    let base = TempDir::new().unwrap();
    let group_id = 200u64;
    let specs = vec![TableSpec::current_state(group_id, "farm-state")];
    let cluster = LocalCluster::start(3, base.path(), &specs).await.unwrap();

    let publisher = CurrentState::<FarmState>::new(group_id, cluster.host(0).clone());
    let observer = CurrentState::<FarmState>::new(group_id, cluster.host(2).clone());
    let mut changes = observer.subscribe().unwrap();

    publisher.publish(&FarmState::new(7, true)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), changes.changed())
        .await
        .expect("follower observed the publish")
        .unwrap();
    let seen = changes.borrow_and_update().clone().expect("value present");
    let state = CurrentState::<FarmState>::decode(&seen).unwrap();
    assert_eq!(state.id, 7);
    assert!(state.running);

    let current = observer.current(Consistency::Quorum).await.unwrap().unwrap();
    assert!(current.running);

    publisher.clear().await.unwrap();
    let cleared = observer.current(Consistency::Quorum).await.unwrap();
    assert!(cleared.is_none());

    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn local_reads_serve_from_the_follower_replica() {
    init_logging();
    let base = TempDir::new().unwrap();
    let specs = vec![TableSpec::key_value::<Role>(tables::ROLES, "roles")];
    let cluster = LocalCluster::start(3, base.path(), &specs).await.unwrap();

    let writer = Repository::<Role>::new(tables::ROLES, cluster.host(0).clone());
    let mut role = Role::new(5, "auditor");
    writer.save(&mut role).await.unwrap();

    // A quorum read on each node establishes the value is applied there,
    // after which the local read must see it too.
    for host in cluster.hosts() {
        let repo = Repository::<Role>::new(tables::ROLES, host.clone());
        repo.get(5, Consistency::Quorum).await.unwrap();
        let local = repo.get(5, Consistency::Local).await.unwrap();
        assert_eq!(local.name, "auditor");
    }

    cluster.shutdown().await.unwrap();
}
