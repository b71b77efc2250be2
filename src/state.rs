//! Mirror state: operator event handlers, waiting-task resolution and the
//! readiness phase machine.
//!
//! All mutable state lives in [`MirrorState`] and is owned by the mirror
//! actor's single dispatch loop. The handlers are synchronous apart from
//! agent hostname resolution, which is injected through [`HostResolver`]
//! so tests can run without a network.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::event::{get_array, get_id, get_in, get_str, EventKind, RawEvent};
use crate::task::{self, AgentId, FrameworkId, NormalizeCtx, Ref, Task, TaskId};

/// Heartbeat interval assumed until SUBSCRIBED announces the real one.
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);

/// Readiness phase of the mirror. Monotone within one connection; a
/// stream reset returns to `Init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No snapshot received yet; nothing is emitted.
    Init,
    /// Waiting for recovered agents to reregister.
    AwaitAgents,
    /// Letting task statuses catch up with the snapshot.
    AwaitTasks,
    /// Fully caught up; updates flow to subscribers.
    Serve,
}

/// Messages the mirror publishes to its subscribers.
#[derive(Debug, Clone)]
pub enum MirrorEvent {
    /// Full snapshot of publishable tasks, sent on entering `Serve`.
    Tasks(Arc<HashMap<TaskId, Task>>),
    /// Incremental update for one task. A terminal `state` means the task
    /// is gone.
    TaskUpdated {
        /// Which task.
        id: TaskId,
        /// Its new normalized record.
        task: Task,
    },
    /// The stream died; mirror state was reset and will be rebuilt on
    /// reconnect.
    Eos,
}

/// Side effects the mirror actor must apply after a handler runs.
#[derive(Debug)]
pub enum Action {
    /// Fan this message out to subscribers.
    Publish(MirrorEvent),
    /// (Re)arm the heartbeat watchdog at three heartbeat intervals.
    ArmWatchdog,
    /// Arm the recovered-agents readiness window.
    ArmAgentsWindow,
    /// Arm the task catch-up readiness window.
    ArmTasksWindow,
}

/// Hostname resolution, injected so the state machine stays testable.
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Resolve a hostname to its IPv4 addresses.
    async fn resolve_ipv4(&self, host: &str) -> std::io::Result<Vec<Ipv4Addr>>;
}

/// Resolver backed by the system resolver through tokio.
#[derive(Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve_ipv4(&self, host: &str) -> std::io::Result<Vec<Ipv4Addr>> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(vec![ip]);
        }
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs
            .filter_map(|addr| match addr.ip() {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(_) => None,
            })
            .collect())
    }
}

/// Fixed-table resolver for tests and air-gapped setups.
#[derive(Debug, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Ipv4Addr>,
}

impl StaticResolver {
    /// Build a resolver from `(hostname, ip)` pairs.
    pub fn new<I: IntoIterator<Item = (String, Ipv4Addr)>>(hosts: I) -> Self {
        Self {
            hosts: hosts.into_iter().collect(),
        }
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn resolve_ipv4(&self, host: &str) -> std::io::Result<Vec<Ipv4Addr>> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(vec![ip]);
        }
        match self.hosts.get(host) {
            Some(&ip) => Ok(vec![ip]),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("unknown host {host}"),
            )),
        }
    }
}

/// In-memory mirror of the cluster, rebuilt from each SUBSCRIBED snapshot
/// plus incremental events.
pub struct MirrorState {
    agents: HashMap<AgentId, Option<Ipv4Addr>>,
    recovered_agents: HashSet<AgentId>,
    frameworks: HashMap<FrameworkId, String>,
    tasks: HashMap<TaskId, Task>,
    waiting_tasks: HashSet<TaskId>,
    phase: Phase,
    heartbeat: Duration,
}

impl Default for MirrorState {
    fn default() -> Self {
        Self::new()
    }
}

impl MirrorState {
    /// Fresh, empty mirror in `Init`.
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
            recovered_agents: HashSet::new(),
            frameworks: HashMap::new(),
            tasks: HashMap::new(),
            waiting_tasks: HashSet::new(),
            phase: Phase::Init,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }

    /// Current readiness phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Announced heartbeat interval.
    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    /// Number of known agents.
    pub fn agents_len(&self) -> usize {
        self.agents.len()
    }

    /// Number of known frameworks.
    pub fn frameworks_len(&self) -> usize {
        self.frameworks.len()
    }

    /// Number of tracked tasks.
    pub fn tasks_len(&self) -> usize {
        self.tasks.len()
    }

    /// Number of tasks parked on unresolved references.
    pub fn waiting_tasks_len(&self) -> usize {
        self.waiting_tasks.len()
    }

    /// Snapshot of tasks with every reference resolved. Parked tasks are
    /// withheld until their agent or framework appears.
    pub fn publishable_tasks(&self) -> HashMap<TaskId, Task> {
        self.tasks
            .iter()
            .filter(|(id, _)| !self.waiting_tasks.contains(id))
            .map(|(id, task)| (id.clone(), task.clone()))
            .collect()
    }

    /// Full stream reset: drop everything and return to `Init`. The
    /// resulting `Eos` is delivered from any phase.
    pub fn reset(&mut self) -> Vec<Action> {
        info!("resetting mirror state after stream end");
        self.agents.clear();
        self.recovered_agents.clear();
        self.frameworks.clear();
        self.tasks.clear();
        self.waiting_tasks.clear();
        self.phase = Phase::Init;
        self.heartbeat = DEFAULT_HEARTBEAT;
        vec![Action::Publish(MirrorEvent::Eos)]
    }

    /// Dispatch one decoded operator event.
    pub async fn apply_event(
        &mut self,
        event: &RawEvent,
        resolver: &dyn HostResolver,
    ) -> Vec<Action> {
        match &event.kind {
            EventKind::Subscribed => self.handle_subscribed(&event.payload, resolver).await,
            EventKind::Heartbeat => vec![Action::ArmWatchdog],
            EventKind::TaskAdded => {
                let Some(raw) = get_in(&event.payload, &["task_added", "task"]) else {
                    warn!("TASK_ADDED without a task object");
                    return Vec::new();
                };
                self.ingest_task_object(raw, None)
            }
            EventKind::TaskUpdated => self.handle_task_updated(&event.payload),
            EventKind::FrameworkAdded | EventKind::FrameworkUpdated => {
                let info = get_in(&event.payload, &["framework_added", "framework", "framework_info"])
                    .or_else(|| {
                        get_in(
                            &event.payload,
                            &["framework_updated", "framework", "framework_info"],
                        )
                    });
                match info {
                    Some(info) => self.handle_framework_upserted(info),
                    None => {
                        warn!("framework event without framework_info");
                        Vec::new()
                    }
                }
            }
            EventKind::FrameworkRemoved => {
                match get_id(&event.payload, &["framework_removed", "framework_info", "id"]) {
                    Some(id) => self.handle_framework_removed(&FrameworkId(id)),
                    None => {
                        warn!("FRAMEWORK_REMOVED without an id");
                        Vec::new()
                    }
                }
            }
            EventKind::AgentAdded => {
                let Some(info) = get_in(&event.payload, &["agent_added", "agent", "agent_info"])
                else {
                    warn!("AGENT_ADDED without agent_info");
                    return Vec::new();
                };
                self.handle_agent_added(info, resolver).await
            }
            EventKind::AgentRemoved => {
                match get_id(&event.payload, &["agent_removed", "agent_id"]) {
                    Some(id) => self.handle_agent_removed(&AgentId(id)),
                    None => {
                        warn!("AGENT_REMOVED without an id");
                        Vec::new()
                    }
                }
            }
            EventKind::Unknown(kind) => {
                debug!(kind = %kind, "ignoring unknown operator event");
                Vec::new()
            }
        }
    }

    async fn handle_subscribed(
        &mut self,
        payload: &Value,
        resolver: &dyn HostResolver,
    ) -> Vec<Action> {
        let subscribed = payload.get("subscribed").cloned().unwrap_or(Value::Null);
        if let Some(seconds) =
            get_in(&subscribed, &["heartbeat_interval_seconds"]).and_then(Value::as_f64)
        {
            self.heartbeat = Duration::from_millis((seconds * 1000.0) as u64);
        }

        let state = get_in(&subscribed, &["get_state"]).cloned().unwrap_or(Value::Null);

        self.recovered_agents = get_array(&state, &["get_agents", "recovered_agents"])
            .iter()
            .filter_map(|info| get_id(info, &["id"]).map(AgentId))
            .collect();

        let mut actions = Vec::new();
        for agent in get_array(&state, &["get_agents", "agents"]) {
            if let Some(info) = agent.get("agent_info") {
                actions.extend(self.handle_agent_added(info, resolver).await);
            }
        }
        for framework in get_array(&state, &["get_frameworks", "frameworks"]) {
            if let Some(info) = framework.get("framework_info") {
                actions.extend(self.handle_framework_upserted(info));
            }
        }
        for task in get_array(&state, &["get_tasks", "tasks"]) {
            actions.extend(self.ingest_task_object(task, None));
        }

        info!(
            agents = self.agents.len(),
            recovered_agents = self.recovered_agents.len(),
            frameworks = self.frameworks.len(),
            tasks = self.tasks.len(),
            waiting_tasks = self.waiting_tasks.len(),
            heartbeat_ms = self.heartbeat.as_millis() as u64,
            "applied SUBSCRIBED snapshot"
        );

        if self.phase == Phase::Init {
            if self.recovered_agents.is_empty() {
                actions.extend(self.enter_await_tasks());
            } else {
                self.phase = Phase::AwaitAgents;
                actions.push(Action::ArmAgentsWindow);
            }
        }
        actions.push(Action::ArmWatchdog);
        actions
    }

    fn handle_task_updated(&mut self, payload: &Value) -> Vec<Action> {
        let Some(update) = payload.get("task_updated") else {
            warn!("TASK_UPDATED without a payload");
            return Vec::new();
        };
        let Some(status) = update.get("status") else {
            warn!("TASK_UPDATED without a status");
            return Vec::new();
        };
        let Some(framework_id) = get_id(update, &["framework_id"]) else {
            warn!("TASK_UPDATED without a framework id");
            return Vec::new();
        };
        let state = get_str(update, &["state"]).map(str::to_string);

        // Reshape the status into a task-shaped object so the normalizer
        // has a single input format. Fields a status cannot carry are
        // merged from the stored record.
        let raw = serde_json::json!({
            "task_id": status.get("task_id"),
            "framework_id": {"value": framework_id},
            "agent_id": status.get("agent_id"),
            "statuses": [status],
        });
        self.ingest_task_object(&raw, state.as_deref())
    }

    /// Normalize and ingest one task-shaped object.
    fn ingest_task_object(&mut self, raw: &Value, state_override: Option<&str>) -> Vec<Action> {
        let Some(task_id) = get_id(raw, &["task_id"]) else {
            warn!("task object without a task_id");
            return Vec::new();
        };
        let Some(framework_id) = get_id(raw, &["framework_id"]) else {
            warn!(task_id = %task_id, "task object without a framework_id");
            return Vec::new();
        };
        let Some(agent_id) = get_id(raw, &["agent_id"]) else {
            warn!(task_id = %task_id, "task object without an agent_id");
            return Vec::new();
        };
        let id = TaskId {
            framework_id: FrameworkId(framework_id.clone()),
            task_id,
        };
        let task = task::normalize(NormalizeCtx {
            raw,
            prev: self.tasks.get(&id),
            agent_id: &AgentId(agent_id),
            framework_id: &FrameworkId(framework_id),
            agents: &self.agents,
            frameworks: &self.frameworks,
            state_override,
        });
        self.ingest_task(id, task)
    }

    /// Store or remove the normalized record and decide what to publish.
    fn ingest_task(&mut self, id: TaskId, task: Task) -> Vec<Action> {
        if self.tasks.get(&id) == Some(&task) {
            return Vec::new();
        }

        if task.state.is_terminal() {
            self.tasks.remove(&id);
            let was_waiting = self.waiting_tasks.remove(&id);
            debug!(task = %id, "task reached a terminal state");
            if was_waiting || task.is_waiting() {
                // Never went out, so nothing to retract.
                return Vec::new();
            }
            return self.publish(MirrorEvent::TaskUpdated { id, task });
        }

        self.tasks.insert(id.clone(), task.clone());
        if task.is_waiting() {
            debug!(task = %id, "parking task on unresolved references");
            self.waiting_tasks.insert(id);
            return Vec::new();
        }
        self.waiting_tasks.remove(&id);
        self.publish(MirrorEvent::TaskUpdated { id, task })
    }

    fn handle_framework_upserted(&mut self, info: &Value) -> Vec<Action> {
        let Some(id) = get_id(info, &["id"]) else {
            warn!("framework_info without an id");
            return Vec::new();
        };
        let Some(name) = get_str(info, &["name"]) else {
            warn!(framework = %id, "framework_info without a name");
            return Vec::new();
        };
        let id = FrameworkId(id);
        debug!(framework = %id, name, "upserting framework");
        self.frameworks.insert(id.clone(), name.to_string());
        let name = name.to_string();
        self.resolve_waiting(|task| {
            let waiting_for_us = matches!(
                &task.framework,
                Some(Ref::Unresolved(waiting_id)) if *waiting_id == id
            );
            if waiting_for_us {
                task.framework = Some(Ref::Resolved(name.clone()));
            }
            waiting_for_us
        })
    }

    fn handle_framework_removed(&mut self, id: &FrameworkId) -> Vec<Action> {
        debug!(framework = %id, "removing framework");
        self.frameworks.remove(id);
        Vec::new()
    }

    async fn handle_agent_added(
        &mut self,
        info: &Value,
        resolver: &dyn HostResolver,
    ) -> Vec<Action> {
        let Some(id) = get_id(info, &["id"]) else {
            warn!("agent_info without an id");
            return Vec::new();
        };
        let id = AgentId(id);
        let ip = match get_str(info, &["hostname"]) {
            Some(hostname) => match resolver.resolve_ipv4(hostname).await {
                Ok(ips) => {
                    if ips.len() > 1 {
                        warn!(agent = %id, hostname, count = ips.len(),
                            "agent hostname resolves to multiple addresses; using the first");
                    }
                    ips.first().copied()
                }
                Err(err) => {
                    warn!(agent = %id, hostname, %err, "agent hostname did not resolve");
                    None
                }
            },
            None => {
                warn!(agent = %id, "agent_info without a hostname");
                None
            }
        };
        debug!(agent = %id, ip = ?ip, "upserting agent");
        self.agents.insert(id.clone(), ip);
        self.recovered_agents.remove(&id);

        let mut actions = self.resolve_waiting(|task| {
            let waiting_for_us = matches!(
                &task.agent_ip,
                Some(Ref::Unresolved(waiting_id)) if *waiting_id == id
            );
            if waiting_for_us {
                task.agent_ip = ip.map(Ref::Resolved);
            }
            waiting_for_us
        });
        actions.extend(self.maybe_exit_await_agents());
        actions
    }

    fn handle_agent_removed(&mut self, id: &AgentId) -> Vec<Action> {
        debug!(agent = %id, "removing agent");
        self.agents.remove(id);
        self.recovered_agents.remove(id);
        self.maybe_exit_await_agents()
    }

    /// Re-check parked tasks after an entity upsert. `patch` fixes the
    /// matching reference in place and reports whether it did.
    fn resolve_waiting<F: FnMut(&mut Task) -> bool>(&mut self, mut patch: F) -> Vec<Action> {
        let mut actions = Vec::new();
        let waiting: Vec<TaskId> = self.waiting_tasks.iter().cloned().collect();
        for id in waiting {
            let Some(task) = self.tasks.get_mut(&id) else {
                self.waiting_tasks.remove(&id);
                continue;
            };
            if !patch(task) {
                continue;
            }
            if task.is_waiting() {
                continue;
            }
            self.waiting_tasks.remove(&id);
            let task = task.clone();
            debug!(task = %id, "task references resolved");
            actions.extend(self.publish(MirrorEvent::TaskUpdated { id, task }));
        }
        actions
    }

    /// Leave `AwaitAgents` early once every recovered agent reregistered.
    fn maybe_exit_await_agents(&mut self) -> Vec<Action> {
        if self.phase == Phase::AwaitAgents && self.recovered_agents.is_empty() {
            info!("all recovered agents reregistered");
            return self.enter_await_tasks();
        }
        Vec::new()
    }

    /// Move to the task catch-up window.
    fn enter_await_tasks(&mut self) -> Vec<Action> {
        self.phase = Phase::AwaitTasks;
        vec![Action::ArmTasksWindow]
    }

    /// The agents readiness window expired.
    pub fn on_agents_window_timeout(&mut self) -> Vec<Action> {
        if self.phase != Phase::AwaitAgents {
            return Vec::new();
        }
        info!(
            missing = self.recovered_agents.len(),
            "agents readiness window expired"
        );
        self.enter_await_tasks()
    }

    /// The task catch-up window expired; start serving.
    pub fn on_tasks_window_timeout(&mut self) -> Vec<Action> {
        if self.phase != Phase::AwaitTasks {
            return Vec::new();
        }
        self.phase = Phase::Serve;
        let snapshot = self.publishable_tasks();
        info!(tasks = snapshot.len(), "mirror is ready; serving");
        vec![Action::Publish(MirrorEvent::Tasks(Arc::new(snapshot)))]
    }

    /// Publication gate: outside `Serve` nothing goes out (`Eos` is
    /// published by `reset` and bypasses this).
    fn publish(&self, event: MirrorEvent) -> Vec<Action> {
        if self.phase == Phase::Serve {
            vec![Action::Publish(event)]
        } else {
            Vec::new()
        }
    }
}
