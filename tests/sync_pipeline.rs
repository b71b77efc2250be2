//! End-to-end scenarios: mirror state machine feeding the projector
//! through the acked pub/sub channel, with the zone landing in a sink.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{
    agent_added, apply, forward, framework_added, mirror_in_serve, running_task, task_added,
    task_updated, DOMAIN,
};
use mesos_dns_sync::state::MirrorEvent;
use mesos_dns_sync::{MemorySink, Projector, SubscriberTable, SyncConfig};

fn test_config() -> SyncConfig {
    SyncConfig {
        leader_ip: Some("10.0.0.100".parse().unwrap()),
        resolvers: vec!["10.0.0.100".parse().unwrap(), "10.0.0.101".parse().unwrap()],
        ..SyncConfig::default()
    }
}

/// A projector wired to a subscriber table and an inspectable sink.
struct Pipeline {
    table: SubscriberTable,
    sink: Arc<MemorySink>,
    cancel: CancellationToken,
    projector: tokio::task::JoinHandle<()>,
}

impl Pipeline {
    fn start(config: SyncConfig) -> Self {
        let mut table = SubscriberTable::new();
        let subscription = table.subscribe("dns-projector").unwrap();
        let sink = Arc::new(MemorySink::new());
        let cancel = CancellationToken::new();
        let mut projector = Projector::new(config, sink.clone());
        let projector_cancel = cancel.clone();
        let projector = tokio::spawn(async move {
            projector.run(subscription, projector_cancel).await;
        });
        Self {
            table,
            sink,
            cancel,
            projector,
        }
    }

    /// Let debounce and master timers drain.
    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(2500)).await;
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        self.projector.await.unwrap();
    }

    fn zone(&self) -> mesos_dns_sync::ZoneRecords {
        self.sink.zone(DOMAIN).expect("zone was pushed")
    }
}

fn agentip(task: &str) -> String {
    format!("{task}.marathon.agentip.{DOMAIN}")
}

#[tokio::test(start_paused = true)]
async fn snapshot_flows_through_to_the_zone() {
    let (_state, snapshot) = mirror_in_serve(json!({
        "get_agents": {"agents": [
            {"agent_info": {"id": {"value": "a1"}, "hostname": "agent1.cluster"}},
        ]},
        "get_frameworks": {"frameworks": [
            {"framework_info": {"id": {"value": "f1"}, "name": "marathon"}},
        ]},
        "get_tasks": {"tasks": [
            running_task("t1", "f1", "a1", "web"),
            running_task("t2", "f1", "a1", "api"),
        ]},
    }))
    .await;

    let mut pipeline = Pipeline::start(test_config());
    forward(&mut pipeline.table, vec![snapshot]).await;
    pipeline.settle().await;

    let zone = pipeline.zone();
    assert!(zone.contains_key(&agentip("web")));
    assert!(zone.contains_key(&agentip("api")));
    assert!(zone.contains_key(DOMAIN), "baseline SOA and NS are present");
    assert!(zone.contains_key(&format!("leader.{DOMAIN}")));
    let masters = zone.get(&format!("master.{DOMAIN}")).unwrap();
    assert_eq!(masters.len(), 2);

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn out_of_order_task_reaches_the_zone_once_resolved() {
    let (mut state, snapshot) = mirror_in_serve(json!({})).await;
    let mut pipeline = Pipeline::start(test_config());
    forward(&mut pipeline.table, vec![snapshot]).await;

    // Task arrives before its agent and framework: nothing is published.
    let events = apply(
        &mut state,
        task_added(running_task("t1", "f1", "a1", "web")),
    )
    .await;
    assert!(events.is_empty());
    assert_eq!(state.waiting_tasks_len(), 1);

    let events = apply(&mut state, agent_added("a1", "agent1.cluster")).await;
    assert!(events.is_empty());

    // The framework closes the gap; the published task is fully resolved.
    let events = apply(&mut state, framework_added("f1", "marathon")).await;
    assert_eq!(events.len(), 1);
    forward(&mut pipeline.table, events).await;
    pipeline.settle().await;

    assert!(pipeline.zone().contains_key(&agentip("web")));
    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn terminal_task_releases_only_unshared_records() {
    // Two tasks with the same name on the same agent produce identical
    // records; the records must survive until the last owner is gone.
    let (mut state, snapshot) = mirror_in_serve(json!({
        "get_agents": {"agents": [
            {"agent_info": {"id": {"value": "a1"}, "hostname": "agent1.cluster"}},
        ]},
        "get_frameworks": {"frameworks": [
            {"framework_info": {"id": {"value": "f1"}, "name": "marathon"}},
        ]},
        "get_tasks": {"tasks": [
            running_task("t1", "f1", "a1", "web"),
            running_task("t2", "f1", "a1", "web"),
        ]},
    }))
    .await;

    let mut pipeline = Pipeline::start(test_config());
    forward(&mut pipeline.table, vec![snapshot]).await;
    pipeline.settle().await;
    assert!(pipeline.zone().contains_key(&agentip("web")));

    let events = apply(&mut state, task_updated("t1", "f1", "a1", "TASK_FINISHED")).await;
    assert_eq!(events.len(), 1);
    forward(&mut pipeline.table, events).await;
    pipeline.settle().await;
    assert!(
        pipeline.zone().contains_key(&agentip("web")),
        "record shared with the surviving task stays"
    );

    let events = apply(&mut state, task_updated("t2", "f1", "a1", "TASK_FINISHED")).await;
    forward(&mut pipeline.table, events).await;
    pipeline.settle().await;
    assert!(
        !pipeline.zone().contains_key(&agentip("web")),
        "last owner gone, record gone"
    );

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn update_bursts_debounce_to_two_pushes() {
    let (mut state, snapshot) = mirror_in_serve(json!({
        "get_agents": {"agents": [
            {"agent_info": {"id": {"value": "a1"}, "hostname": "agent1.cluster"}},
        ]},
        "get_frameworks": {"frameworks": [
            {"framework_info": {"id": {"value": "f1"}, "name": "marathon"}},
        ]},
    }))
    .await;

    let mut pipeline = Pipeline::start(test_config());
    forward(&mut pipeline.table, vec![snapshot]).await;
    pipeline.settle().await;
    let pushes_before = pipeline.sink.assign_count();

    // 100 distinct changes, all inside one debounce window.
    let mut burst = Vec::new();
    for i in 0..100 {
        let name = format!("web-{i}");
        let events = apply(
            &mut state,
            task_added(running_task(&format!("t{i}"), "f1", "a1", &name)),
        )
        .await;
        burst.extend(events);
    }
    assert_eq!(burst.len(), 100);
    forward(&mut pipeline.table, burst).await;
    pipeline.settle().await;

    // One immediate push plus one coalesced push at the window boundary.
    assert_eq!(pipeline.sink.assign_count() - pushes_before, 2);
    let zone = pipeline.zone();
    for i in 0..100 {
        assert!(zone.contains_key(&agentip(&format!("web-{i}"))));
    }

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_retains_records_and_rebuilds_exactly() {
    let (mut state, snapshot) = mirror_in_serve(json!({
        "get_agents": {"agents": [
            {"agent_info": {"id": {"value": "a1"}, "hostname": "agent1.cluster"}},
        ]},
        "get_frameworks": {"frameworks": [
            {"framework_info": {"id": {"value": "f1"}, "name": "marathon"}},
        ]},
        "get_tasks": {"tasks": [
            running_task("t1", "f1", "a1", "web"),
            running_task("t2", "f1", "a1", "api"),
        ]},
    }))
    .await;

    let mut pipeline = Pipeline::start(test_config());
    forward(&mut pipeline.table, vec![snapshot]).await;
    pipeline.settle().await;
    assert!(pipeline.zone().contains_key(&agentip("web")));

    // The stream dies: one Eos, task records retained, masters dropped.
    let eos: Vec<MirrorEvent> = state
        .reset()
        .into_iter()
        .filter_map(|action| match action {
            mesos_dns_sync::state::Action::Publish(event) => Some(event),
            _ => None,
        })
        .collect();
    assert_eq!(eos.len(), 1);
    forward(&mut pipeline.table, eos).await;
    pipeline.settle().await;

    let zone = pipeline.zone();
    assert!(
        zone.contains_key(&agentip("web")),
        "records survive a brief reconnect"
    );

    // Reconnect with a snapshot missing one task: the rebuild drops it.
    let (_state, snapshot) = mirror_in_serve(json!({
        "get_agents": {"agents": [
            {"agent_info": {"id": {"value": "a1"}, "hostname": "agent1.cluster"}},
        ]},
        "get_frameworks": {"frameworks": [
            {"framework_info": {"id": {"value": "f1"}, "name": "marathon"}},
        ]},
        "get_tasks": {"tasks": [
            running_task("t1", "f1", "a1", "web"),
        ]},
    }))
    .await;
    forward(&mut pipeline.table, vec![snapshot]).await;
    pipeline.settle().await;

    let zone = pipeline.zone();
    assert!(zone.contains_key(&agentip("web")));
    assert!(!zone.contains_key(&agentip("api")), "no leaked records");
    assert!(
        zone.contains_key(&format!("master.{DOMAIN}")),
        "masters come back with the new snapshot"
    );

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn subscribers_see_snapshot_then_consistent_updates() {
    let (mut state, snapshot) = mirror_in_serve(json!({
        "get_agents": {"agents": [
            {"agent_info": {"id": {"value": "a1"}, "hostname": "agent1.cluster"}},
        ]},
        "get_frameworks": {"frameworks": [
            {"framework_info": {"id": {"value": "f1"}, "name": "marathon"}},
        ]},
        "get_tasks": {"tasks": [running_task("t1", "f1", "a1", "web")]},
    }))
    .await;

    let MirrorEvent::Tasks(initial) = &snapshot else {
        panic!("expected a snapshot");
    };
    let mut view = (**initial).clone();

    // Apply a stream of updates to the snapshot the way a subscriber
    // would and check the result matches the mirror's own view.
    let mut updates = Vec::new();
    updates.extend(apply(&mut state, task_added(running_task("t2", "f1", "a1", "api"))).await);
    updates.extend(apply(&mut state, task_updated("t1", "f1", "a1", "TASK_FINISHED")).await);
    for update in updates {
        match update {
            MirrorEvent::TaskUpdated { id, task } => {
                if task.state.is_terminal() {
                    view.remove(&id);
                } else {
                    view.insert(id, task);
                }
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
    assert_eq!(view, state.publishable_tasks());
}
