//! Shared test infrastructure for the sync pipeline tests.

use std::time::Duration;

use serde_json::{json, Value};

use mesos_dns_sync::event::RawEvent;
use mesos_dns_sync::state::{Action, MirrorEvent, MirrorState, Phase, StaticResolver};
use mesos_dns_sync::SubscriberTable;

/// Zone used throughout the tests.
pub const DOMAIN: &str = "dcos.thisdcos.directory";

/// Generous ack window; the projector acks promptly.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolver with a few well-known agents.
pub fn resolver() -> StaticResolver {
    StaticResolver::new([
        ("agent1.cluster".to_string(), "10.0.0.1".parse().unwrap()),
        ("agent2.cluster".to_string(), "10.0.0.2".parse().unwrap()),
        ("agent3.cluster".to_string(), "10.0.0.3".parse().unwrap()),
    ])
}

// --- Event builders ---

pub fn subscribed(heartbeat_seconds: f64, state: Value) -> RawEvent {
    RawEvent::from_value(json!({
        "type": "SUBSCRIBED",
        "subscribed": {
            "heartbeat_interval_seconds": heartbeat_seconds,
            "get_state": state,
        },
    }))
    .unwrap()
}

pub fn agent_added(id: &str, hostname: &str) -> RawEvent {
    RawEvent::from_value(json!({
        "type": "AGENT_ADDED",
        "agent_added": {"agent": {"agent_info": {
            "id": {"value": id},
            "hostname": hostname,
        }}},
    }))
    .unwrap()
}

pub fn framework_added(id: &str, name: &str) -> RawEvent {
    RawEvent::from_value(json!({
        "type": "FRAMEWORK_ADDED",
        "framework_added": {"framework": {"framework_info": {
            "id": {"value": id},
            "name": name,
        }}},
    }))
    .unwrap()
}

/// Task object for snapshots and TASK_ADDED payloads.
pub fn running_task(task_id: &str, framework_id: &str, agent_id: &str, name: &str) -> Value {
    json!({
        "task_id": {"value": task_id},
        "framework_id": {"value": framework_id},
        "agent_id": {"value": agent_id},
        "name": name,
        "state": "TASK_RUNNING",
    })
}

pub fn task_added(task: Value) -> RawEvent {
    RawEvent::from_value(json!({
        "type": "TASK_ADDED",
        "task_added": {"task": task},
    }))
    .unwrap()
}

pub fn task_updated(task_id: &str, framework_id: &str, agent_id: &str, state: &str) -> RawEvent {
    RawEvent::from_value(json!({
        "type": "TASK_UPDATED",
        "task_updated": {
            "framework_id": {"value": framework_id},
            "state": state,
            "status": {
                "task_id": {"value": task_id},
                "agent_id": {"value": agent_id},
                "state": state,
                "timestamp": 1.0,
            },
        },
    }))
    .unwrap()
}

// --- Mirror-side harness ---

/// Apply one event and collect what it published.
pub async fn apply(state: &mut MirrorState, event: RawEvent) -> Vec<MirrorEvent> {
    let actions = state.apply_event(&event, &resolver()).await;
    actions
        .into_iter()
        .filter_map(|action| match action {
            Action::Publish(event) => Some(event),
            _ => None,
        })
        .collect()
}

/// Drive a fresh mirror through SUBSCRIBED and both readiness windows,
/// returning the serving state plus the full-snapshot message.
pub async fn mirror_in_serve(state_payload: Value) -> (MirrorState, MirrorEvent) {
    let mut state = MirrorState::new();
    apply(&mut state, subscribed(15.0, state_payload)).await;
    let mut actions = state.on_agents_window_timeout();
    actions.extend(state.on_tasks_window_timeout());
    assert_eq!(state.phase(), Phase::Serve);
    let snapshot = actions
        .into_iter()
        .find_map(|action| match action {
            Action::Publish(event @ MirrorEvent::Tasks(_)) => Some(event),
            _ => None,
        })
        .expect("entering serve publishes a snapshot");
    (state, snapshot)
}

/// Publish mirror messages through a subscriber table.
pub async fn forward(table: &mut SubscriberTable, events: Vec<MirrorEvent>) {
    for event in events {
        table.publish(&event, ACK_TIMEOUT).await;
    }
}
