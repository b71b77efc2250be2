//! Normalized task model and the task normalizer.
//!
//! The normalizer turns a raw operator task object into a [`Task`] using
//! the current agent and framework tables. Extraction is per-field: a
//! malformed field is logged and the previous value is retained, so one
//! bad status never destroys an otherwise healthy record.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use serde_json::Value;
use tracing::{debug, warn};

use crate::event::{get_array, get_in, get_str};

/// Opaque agent identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId(pub String);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque framework identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameworkId(pub String);

impl fmt::Display for FrameworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A task is identified by its framework plus the raw task id; raw task
/// ids are only unique within one framework.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    /// Owning framework.
    pub framework_id: FrameworkId,
    /// Raw task id as assigned by the framework.
    pub task_id: String,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.framework_id, self.task_id)
    }
}

/// A cross-entity reference that may not have been resolved yet.
///
/// Events can reference agents and frameworks before those entities are
/// announced; an `Unresolved` value parks the task until they are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ref<T, I> {
    /// The referenced entity is known and its value is embedded.
    Resolved(T),
    /// The referenced entity has not been announced yet.
    Unresolved(I),
}

impl<T, I> Ref<T, I> {
    /// The resolved value, if any.
    pub fn resolved(&self) -> Option<&T> {
        match self {
            Self::Resolved(value) => Some(value),
            Self::Unresolved(_) => None,
        }
    }

    /// Whether this reference is still unresolved.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Unresolved(_))
    }
}

/// Coarse task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskState {
    /// Everything before the task runs.
    #[default]
    Preparing,
    /// The task is running.
    Running,
    /// The task is being killed.
    Killing,
    /// The task is gone; terminal states remove the task from the mirror.
    Terminal,
}

impl TaskState {
    /// Map a raw operator state string.
    pub fn from_operator(state: &str) -> Self {
        match state {
            "TASK_RUNNING" => Self::Running,
            "TASK_KILLING" => Self::Killing,
            "TASK_FINISHED" | "TASK_FAILED" | "TASK_KILLED" | "TASK_LOST" | "TASK_ERROR"
            | "TASK_DROPPED" | "TASK_GONE" | "TASK_GONE_BY_OPERATOR" => Self::Terminal,
            _ => Self::Preparing,
        }
    }

    /// Whether this state removes the task.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminal)
    }
}

/// Container runtime the task runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    /// Mesos universal containerizer.
    Mesos,
    /// Docker containerizer.
    Docker,
    /// Anything else.
    Unknown,
}

/// Port protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Protocol {
    /// TCP (the default when unspecified).
    #[default]
    Tcp,
    /// UDP.
    Udp,
}

impl Protocol {
    fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            _ => None,
        }
    }
}

/// A task port merged from the port-mapping, resource and discovery
/// sources.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Port {
    /// Discovery name, if any.
    pub name: Option<String>,
    /// Protocol; TCP when the source does not say.
    pub protocol: Protocol,
    /// Container-side port.
    pub port: Option<u16>,
    /// Host-side port.
    pub host_port: Option<u16>,
    /// Virtual-IP service labels attached to this port.
    pub vip: Vec<String>,
}

impl Port {
    /// Two ports describe the same endpoint when the protocol matches and
    /// either the container or the host port coincides.
    fn matches(&self, other: &Port) -> bool {
        fn both_eq(a: Option<u16>, b: Option<u16>) -> bool {
            matches!((a, b), (Some(x), Some(y)) if x == y)
        }
        self.protocol == other.protocol
            && (both_eq(self.port, other.port) || both_eq(self.host_port, other.host_port))
    }

    /// Merge `other` into `self`, filling absent fields and unioning vips.
    fn merge(&mut self, other: Port) {
        if self.name.is_none() {
            self.name = other.name;
        }
        if self.port.is_none() {
            self.port = other.port;
        }
        if self.host_port.is_none() {
            self.host_port = other.host_port;
        }
        self.vip.extend(other.vip);
        self.vip.sort();
        self.vip.dedup();
    }
}

/// Normalized view of one task, as consumed by the record builder.
///
/// Fields are merged additively across events: an absent or empty field in
/// a later event never erases an earlier non-empty value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Task {
    /// Task name.
    pub name: Option<String>,
    /// Owning framework's name, or the id we are waiting for.
    pub framework: Option<Ref<String, FrameworkId>>,
    /// IP of the agent hosting the task. `None` means the agent is known
    /// but its hostname did not resolve.
    pub agent_ip: Option<Ref<Ipv4Addr, AgentId>>,
    /// Container IPs from the latest status.
    pub task_ip: Vec<IpAddr>,
    /// Lifecycle state.
    pub state: TaskState,
    /// Latest health check verdict, if any checks exist.
    pub healthy: Option<bool>,
    /// Merged ports.
    pub ports: Vec<Port>,
    /// Container runtime.
    pub runtime: Option<ContainerRuntime>,
}

impl Task {
    /// Whether the task still carries an unresolved cross-reference and
    /// must be parked instead of published.
    pub fn is_waiting(&self) -> bool {
        let agent_waiting = matches!(self.agent_ip, Some(Ref::Unresolved(_)));
        let framework_waiting = matches!(self.framework, Some(Ref::Unresolved(_)));
        agent_waiting || framework_waiting
    }
}

/// Inputs to one normalization pass.
pub(crate) struct NormalizeCtx<'a> {
    /// Raw task-shaped object (from TASK_ADDED, the snapshot, or a
    /// synthesized object wrapping a TASK_UPDATED status).
    pub raw: &'a Value,
    /// Currently stored record, if any.
    pub prev: Option<&'a Task>,
    /// Agent the task runs on.
    pub agent_id: &'a AgentId,
    /// Framework that owns the task.
    pub framework_id: &'a FrameworkId,
    /// Known agents; `None` means tracked but without an address.
    pub agents: &'a HashMap<AgentId, Option<Ipv4Addr>>,
    /// Known frameworks.
    pub frameworks: &'a HashMap<FrameworkId, String>,
    /// Event-level state of TASK_UPDATED, authoritative over the status.
    pub state_override: Option<&'a str>,
}

/// Derive the normalized task record.
pub(crate) fn normalize(ctx: NormalizeCtx<'_>) -> Task {
    let prev = ctx.prev;
    let latest = latest_status(ctx.raw);

    let agent_ip = match ctx.agents.get(ctx.agent_id) {
        Some(Some(ip)) => Some(Ref::Resolved(*ip)),
        Some(None) => None,
        None => match prev.map(|t| &t.agent_ip) {
            Some(resolved @ Some(Ref::Resolved(_))) => resolved.clone(),
            _ => Some(Ref::Unresolved(ctx.agent_id.clone())),
        },
    };
    let framework = match ctx.frameworks.get(ctx.framework_id) {
        Some(name) => Some(Ref::Resolved(name.clone())),
        None => match prev.map(|t| &t.framework) {
            Some(resolved @ Some(Ref::Resolved(_))) => resolved.clone(),
            _ => Some(Ref::Unresolved(ctx.framework_id.clone())),
        },
    };

    let state = match extract_state(ctx.raw, latest, ctx.state_override) {
        Ok(Some(state)) => state,
        Ok(None) => prev.map(|t| t.state).unwrap_or_default(),
        Err(err) => {
            warn!(field = "state", %err, "task field extraction failed; keeping previous value");
            prev.map(|t| t.state).unwrap_or_default()
        }
    };
    let runtime = keep("runtime", prev.and_then(|t| t.runtime), extract_runtime(ctx.raw));

    let mut task = Task {
        name: keep("name", prev.and_then(|t| t.name.clone()), extract_name(ctx.raw)),
        framework,
        agent_ip,
        task_ip: keep_list("task_ip", prev.map(|t| t.task_ip.clone()), extract_task_ips(latest)),
        state,
        healthy: keep(
            "healthy",
            prev.and_then(|t| t.healthy),
            extract_healthy(ctx.raw, latest),
        ),
        ports: keep_list(
            "ports",
            prev.map(|t| t.ports.clone()),
            extract_ports(ctx.raw, latest, runtime),
        ),
        runtime,
    };
    collapse_host_ports(&mut task);
    task
}

/// Apply the merge rule for one optional field.
fn keep<T>(field: &'static str, prev: Option<T>, got: Result<Option<T>, String>) -> Option<T> {
    match got {
        Ok(Some(value)) => Some(value),
        Ok(None) => prev,
        Err(err) => {
            warn!(field, %err, "task field extraction failed; keeping previous value");
            prev
        }
    }
}

/// Same merge rule for list fields, where empty means absent.
fn keep_list<T>(
    field: &'static str,
    prev: Option<Vec<T>>,
    got: Result<Option<Vec<T>>, String>,
) -> Vec<T> {
    keep(field, prev, got).unwrap_or_default()
}

/// Latest status by descending timestamp.
fn latest_status(raw: &Value) -> Option<&Value> {
    let statuses = get_array(raw, &["statuses"]);
    statuses.iter().max_by(|a, b| {
        let ta = a.get("timestamp").and_then(Value::as_f64).unwrap_or(f64::MIN);
        let tb = b.get("timestamp").and_then(Value::as_f64).unwrap_or(f64::MIN);
        ta.total_cmp(&tb)
    })
}

fn extract_name(raw: &Value) -> Result<Option<String>, String> {
    match raw.get("name") {
        None => Ok(None),
        Some(Value::String(name)) if name.is_empty() => Ok(None),
        Some(Value::String(name)) => Ok(Some(name.clone())),
        Some(other) => Err(format!("name is not a string: {other}")),
    }
}

fn extract_state(
    raw: &Value,
    latest: Option<&Value>,
    state_override: Option<&str>,
) -> Result<Option<TaskState>, String> {
    let text = state_override
        .or_else(|| raw.get("state").and_then(Value::as_str))
        .or_else(|| latest.and_then(|s| s.get("state")).and_then(Value::as_str));
    Ok(text.map(TaskState::from_operator))
}

fn extract_healthy(raw: &Value, latest: Option<&Value>) -> Result<Option<bool>, String> {
    if let Some(value) = latest.and_then(|s| s.get("healthy")) {
        return value
            .as_bool()
            .map(Some)
            .ok_or_else(|| format!("healthy is not a bool: {value}"));
    }
    // A task with a health check but no verdict yet counts as unhealthy.
    if raw.get("health_check").is_some() {
        return Ok(Some(false));
    }
    Ok(None)
}

fn extract_task_ips(latest: Option<&Value>) -> Result<Option<Vec<IpAddr>>, String> {
    let Some(status) = latest else {
        return Ok(None);
    };
    let mut out = Vec::new();
    for info in get_array(status, &["container_status", "network_infos"]) {
        for address in get_array(info, &["ip_addresses"]) {
            let Some(text) = get_str(address, &["ip_address"]) else {
                continue;
            };
            match text.parse::<IpAddr>() {
                Ok(ip) => out.push(ip),
                Err(_) => warn!(address = text, "dropping unparseable task IP"),
            }
        }
    }
    if out.is_empty() {
        Ok(None)
    } else {
        Ok(Some(out))
    }
}

fn extract_runtime(raw: &Value) -> Result<Option<ContainerRuntime>, String> {
    match get_str(raw, &["container", "type"]) {
        None => Ok(None),
        Some("MESOS") => Ok(Some(ContainerRuntime::Mesos)),
        Some("DOCKER") => Ok(Some(ContainerRuntime::Docker)),
        Some(other) => {
            debug!(container_type = other, "unrecognized container type");
            Ok(Some(ContainerRuntime::Unknown))
        }
    }
}

fn extract_ports(
    raw: &Value,
    latest: Option<&Value>,
    runtime: Option<ContainerRuntime>,
) -> Result<Option<Vec<Port>>, String> {
    let mut ports = Vec::new();
    ports.extend(mapping_ports(raw, latest, runtime));
    ports.extend(vip_label_ports(raw));
    ports.extend(discovery_ports(raw));
    let merged = merge_ports(ports);
    if merged.is_empty() {
        Ok(None)
    } else {
        Ok(Some(merged))
    }
}

/// Ports from container port mappings. Docker tasks carry them on the
/// docker info; Mesos tasks on the network infos of the latest status
/// (pods) or of the task's container.
fn mapping_ports(raw: &Value, latest: Option<&Value>, runtime: Option<ContainerRuntime>) -> Vec<Port> {
    let mut out = Vec::new();
    if runtime == Some(ContainerRuntime::Docker) {
        for mapping in get_array(raw, &["container", "docker", "port_mappings"]) {
            out.extend(mapping_port(mapping));
        }
        return out;
    }
    let mut infos = latest
        .map(|s| get_array(s, &["container_status", "network_infos"]))
        .unwrap_or(&[]);
    if infos.is_empty() {
        infos = get_array(raw, &["container", "network_infos"]);
    }
    for info in infos {
        for mapping in get_array(info, &["port_mappings"]) {
            out.extend(mapping_port(mapping));
        }
    }
    out
}

fn mapping_port(mapping: &Value) -> Option<Port> {
    let protocol = mapping
        .get("protocol")
        .and_then(Value::as_str)
        .and_then(Protocol::parse)
        .unwrap_or_default();
    let port = port_number(mapping.get("container_port"));
    let host_port = port_number(mapping.get("host_port"));
    if port.is_none() && host_port.is_none() {
        return None;
    }
    Some(Port {
        protocol,
        port,
        host_port,
        ..Port::default()
    })
}

/// Ports selected by `vip_port<N>` task labels out of the ordered list of
/// ports declared in the task's `ports` resource.
fn vip_label_ports(raw: &Value) -> Vec<Port> {
    let mut out = Vec::new();
    let mut resource_ports: Option<Vec<u16>> = None;
    for label in get_array(raw, &["labels", "labels"]) {
        let (Some(key), Some(value)) = (get_str(label, &["key"]), get_str(label, &["value"]))
        else {
            continue;
        };
        let Some(index) = key.strip_prefix("vip_port").and_then(|n| n.parse::<usize>().ok())
        else {
            continue;
        };
        let (protocol, vip) = match value.split_once("://") {
            Some(("tcp", vip)) => (Protocol::Tcp, vip),
            Some(("udp", vip)) => (Protocol::Udp, vip),
            _ => {
                warn!(label = key, value, "vip label without a tcp:// or udp:// scheme");
                continue;
            }
        };
        let ordered = resource_ports.get_or_insert_with(|| expand_resource_ports(raw));
        match ordered.get(index) {
            Some(&host_port) => out.push(Port {
                protocol,
                host_port: Some(host_port),
                vip: vec![vip.to_string()],
                ..Port::default()
            }),
            None => warn!(label = key, index, "vip label points past the declared ports"),
        }
    }
    out
}

/// Expand the `ports` resource into an ordered port list.
fn expand_resource_ports(raw: &Value) -> Vec<u16> {
    let mut out = Vec::new();
    for resource in get_array(raw, &["resources"]) {
        if get_str(resource, &["name"]) != Some("ports") {
            continue;
        }
        match get_str(resource, &["type"]) {
            Some("RANGES") => {
                for range in get_array(resource, &["ranges", "range"]) {
                    let begin = range.get("begin").and_then(Value::as_u64);
                    let end = range.get("end").and_then(Value::as_u64);
                    if let (Some(begin), Some(end)) = (begin, end) {
                        for value in begin..=end {
                            match u16::try_from(value) {
                                Ok(port) => out.push(port),
                                Err(_) => warn!(value, "port outside the u16 range"),
                            }
                        }
                    }
                }
            }
            Some("SCALAR") => {
                if let Some(value) = get_in(resource, &["scalar", "value"]).and_then(Value::as_u64)
                {
                    match u16::try_from(value) {
                        Ok(port) => out.push(port),
                        Err(_) => warn!(value, "port outside the u16 range"),
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// Ports declared through discovery info.
fn discovery_ports(raw: &Value) -> Vec<Port> {
    let mut out = Vec::new();
    for port in get_array(raw, &["discovery", "ports", "ports"]) {
        let Some(number) = port_number(port.get("number")) else {
            continue;
        };
        let protocol = match port.get("protocol").and_then(Value::as_str) {
            None => Protocol::default(),
            Some(text) => match Protocol::parse(text) {
                Some(protocol) => protocol,
                None => {
                    debug!(protocol = text, "discarding discovery port with unknown protocol");
                    continue;
                }
            },
        };
        let name = port
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();
        let mut vip = Vec::new();
        let mut host_scope = false;
        for label in get_array(port, &["labels", "labels"]) {
            let (Some(key), Some(value)) = (get_str(label, &["key"]), get_str(label, &["value"]))
            else {
                continue;
            };
            if key.starts_with("VIP") || key.starts_with("vip") {
                vip.push(value.to_string());
            } else if key == "network-scope" {
                host_scope = value == "host";
            }
        }
        let (container_port, host_port) = if host_scope {
            (None, Some(number))
        } else {
            (Some(number), None)
        };
        out.push(Port {
            name: Some(name),
            protocol,
            port: container_port,
            host_port,
            vip,
        });
    }
    out
}

fn port_number(value: Option<&Value>) -> Option<u16> {
    let number = value?.as_u64()?;
    match u16::try_from(number) {
        Ok(port) => Some(port),
        Err(_) => {
            warn!(value = number, "port outside the u16 range");
            None
        }
    }
}

/// Merge ports pairwise under the protocol and port/host-port match rule.
fn merge_ports(ports: Vec<Port>) -> Vec<Port> {
    let mut merged: Vec<Port> = Vec::new();
    for port in ports {
        match merged.iter_mut().find(|existing| existing.matches(&port)) {
            Some(existing) => existing.merge(port),
            None => merged.push(port),
        }
    }
    merged
}

/// Under host networking the container IP is the agent IP and the host
/// port is the only real endpoint; fold it into the container port slot.
fn collapse_host_ports(task: &mut Task) {
    if matches!(task.state, TaskState::Preparing | TaskState::Terminal) {
        return;
    }
    let Some(agent_ip) = task.agent_ip.as_ref().and_then(Ref::resolved).copied() else {
        return;
    };
    if task.task_ip != [IpAddr::V4(agent_ip)] {
        return;
    }
    let rewritten = std::mem::take(&mut task.ports)
        .into_iter()
        .map(|mut port| {
            if let Some(host_port) = port.host_port.take() {
                port.port = Some(host_port);
            }
            port
        })
        .collect();
    task.ports = merge_ports(rewritten);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn agent_id() -> AgentId {
        AgentId("agent-1".to_string())
    }

    fn framework_id() -> FrameworkId {
        FrameworkId("framework-1".to_string())
    }

    fn known_agents() -> HashMap<AgentId, Option<Ipv4Addr>> {
        HashMap::from([(agent_id(), Some("10.0.0.1".parse().unwrap()))])
    }

    fn known_frameworks() -> HashMap<FrameworkId, String> {
        HashMap::from([(framework_id(), "marathon".to_string())])
    }

    fn run_normalize(raw: &Value, prev: Option<&Task>) -> Task {
        normalize(NormalizeCtx {
            raw,
            prev,
            agent_id: &agent_id(),
            framework_id: &framework_id(),
            agents: &known_agents(),
            frameworks: &known_frameworks(),
            state_override: None,
        })
    }

    #[test]
    fn test_maps_operator_states() {
        assert_eq!(TaskState::from_operator("TASK_RUNNING"), TaskState::Running);
        assert_eq!(TaskState::from_operator("TASK_KILLING"), TaskState::Killing);
        for terminal in [
            "TASK_FINISHED",
            "TASK_FAILED",
            "TASK_KILLED",
            "TASK_LOST",
            "TASK_ERROR",
            "TASK_DROPPED",
            "TASK_GONE",
            "TASK_GONE_BY_OPERATOR",
        ] {
            assert_eq!(TaskState::from_operator(terminal), TaskState::Terminal);
        }
        assert_eq!(TaskState::from_operator("TASK_STAGING"), TaskState::Preparing);
        assert_eq!(TaskState::from_operator("whatever"), TaskState::Preparing);
    }

    #[test]
    fn test_resolves_agent_and_framework() {
        let raw = json!({"name": "web", "state": "TASK_RUNNING"});
        let task = run_normalize(&raw, None);
        assert_eq!(task.name.as_deref(), Some("web"));
        assert_eq!(
            task.agent_ip,
            Some(Ref::Resolved("10.0.0.1".parse().unwrap()))
        );
        assert_eq!(task.framework, Some(Ref::Resolved("marathon".to_string())));
        assert!(!task.is_waiting());
    }

    #[test]
    fn test_unknown_agent_parks_the_task() {
        let raw = json!({"name": "web", "state": "TASK_RUNNING"});
        let task = normalize(NormalizeCtx {
            raw: &raw,
            prev: None,
            agent_id: &AgentId("missing".to_string()),
            framework_id: &framework_id(),
            agents: &known_agents(),
            frameworks: &known_frameworks(),
            state_override: None,
        });
        assert_eq!(
            task.agent_ip,
            Some(Ref::Unresolved(AgentId("missing".to_string())))
        );
        assert!(task.is_waiting());
    }

    #[test]
    fn test_tracked_agent_without_address_leaves_ip_unset() {
        let raw = json!({"state": "TASK_RUNNING"});
        let agents = HashMap::from([(agent_id(), None)]);
        let task = normalize(NormalizeCtx {
            raw: &raw,
            prev: None,
            agent_id: &agent_id(),
            framework_id: &framework_id(),
            agents: &agents,
            frameworks: &known_frameworks(),
            state_override: None,
        });
        assert_eq!(task.agent_ip, None);
        assert!(!task.is_waiting());
    }

    #[test]
    fn test_removed_framework_keeps_last_seen_name() {
        let raw = json!({"state": "TASK_RUNNING"});
        let prev = Task {
            framework: Some(Ref::Resolved("marathon".to_string())),
            ..Task::default()
        };
        let task = normalize(NormalizeCtx {
            raw: &raw,
            prev: Some(&prev),
            agent_id: &agent_id(),
            framework_id: &framework_id(),
            agents: &known_agents(),
            frameworks: &HashMap::new(),
            state_override: None,
        });
        assert_eq!(task.framework, Some(Ref::Resolved("marathon".to_string())));
    }

    #[test]
    fn test_state_override_beats_embedded_state() {
        let raw = json!({
            "state": "TASK_RUNNING",
            "statuses": [{"state": "TASK_STAGING", "timestamp": 1.0}],
        });
        let task = normalize(NormalizeCtx {
            raw: &raw,
            prev: None,
            agent_id: &agent_id(),
            framework_id: &framework_id(),
            agents: &known_agents(),
            frameworks: &known_frameworks(),
            state_override: Some("TASK_FINISHED"),
        });
        assert_eq!(task.state, TaskState::Terminal);
    }

    #[test]
    fn test_health_check_without_verdict_is_unhealthy() {
        let raw = json!({"health_check": {}, "state": "TASK_RUNNING"});
        assert_eq!(run_normalize(&raw, None).healthy, Some(false));
    }

    #[test]
    fn test_status_health_verdict_wins() {
        let raw = json!({
            "health_check": {},
            "state": "TASK_RUNNING",
            "statuses": [{"healthy": true, "timestamp": 1.0}],
        });
        assert_eq!(run_normalize(&raw, None).healthy, Some(true));
    }

    #[test]
    fn test_no_health_information_leaves_health_unset() {
        let raw = json!({"state": "TASK_RUNNING"});
        assert_eq!(run_normalize(&raw, None).healthy, None);
    }

    #[test]
    fn test_takes_ips_from_latest_status_only() {
        let raw = json!({
            "state": "TASK_RUNNING",
            "statuses": [
                {
                    "timestamp": 2.0,
                    "container_status": {"network_infos": [
                        {"ip_addresses": [{"ip_address": "9.9.9.9"}]}
                    ]},
                },
                {
                    "timestamp": 5.0,
                    "container_status": {"network_infos": [
                        {"ip_addresses": [{"ip_address": "1.2.3.4"}, {"ip_address": "not-an-ip"}]}
                    ]},
                },
            ],
        });
        let task = run_normalize(&raw, None);
        assert_eq!(task.task_ip, vec!["1.2.3.4".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_empty_update_does_not_erase_prior_fields() {
        let prev = Task {
            name: Some("web".to_string()),
            task_ip: vec!["9.9.9.9".parse().unwrap()],
            healthy: Some(true),
            runtime: Some(ContainerRuntime::Docker),
            ..Task::default()
        };
        let raw = json!({"state": "TASK_RUNNING"});
        let task = run_normalize(&raw, Some(&prev));
        assert_eq!(task.name.as_deref(), Some("web"));
        assert_eq!(task.task_ip, prev.task_ip);
        assert_eq!(task.healthy, Some(true));
        assert_eq!(task.runtime, Some(ContainerRuntime::Docker));
    }

    #[test]
    fn test_malformed_field_keeps_previous_value() {
        let prev = Task {
            name: Some("web".to_string()),
            ..Task::default()
        };
        let raw = json!({"name": 42, "state": "TASK_RUNNING"});
        let task = run_normalize(&raw, Some(&prev));
        assert_eq!(task.name.as_deref(), Some("web"));
    }

    #[test]
    fn test_docker_port_mappings() {
        let raw = json!({
            "state": "TASK_STAGING",
            "container": {
                "type": "DOCKER",
                "docker": {"port_mappings": [
                    {"container_port": 80, "host_port": 31000, "protocol": "tcp"},
                ]},
            },
        });
        let task = run_normalize(&raw, None);
        assert_eq!(task.runtime, Some(ContainerRuntime::Docker));
        assert_eq!(
            task.ports,
            vec![Port {
                protocol: Protocol::Tcp,
                port: Some(80),
                host_port: Some(31000),
                ..Port::default()
            }]
        );
    }

    #[test]
    fn test_pod_port_mappings_come_from_latest_status() {
        let raw = json!({
            "state": "TASK_RUNNING",
            "container": {"type": "MESOS"},
            "statuses": [{
                "timestamp": 1.0,
                "container_status": {"network_infos": [{
                    "ip_addresses": [{"ip_address": "9.9.9.9"}],
                    "port_mappings": [{"container_port": 8080, "host_port": 31500}],
                }]},
            }],
        });
        let task = run_normalize(&raw, None);
        assert_eq!(
            task.ports,
            vec![Port {
                protocol: Protocol::Tcp,
                port: Some(8080),
                host_port: Some(31500),
                ..Port::default()
            }]
        );
    }

    #[test]
    fn test_vip_labels_select_resource_ports() {
        let raw = json!({
            "state": "TASK_STAGING",
            "resources": [
                {"name": "cpus", "type": "SCALAR", "scalar": {"value": 0.5}},
                {"name": "ports", "type": "RANGES", "ranges": {"range": [
                    {"begin": 31000, "end": 31001},
                ]}},
            ],
            "labels": {"labels": [
                {"key": "vip_port1", "value": "tcp://web.marathon:80"},
                {"key": "vip_port9", "value": "tcp://ignored:1"},
                {"key": "vip_port0", "value": "ftp://nope:2"},
            ]},
        });
        let task = run_normalize(&raw, None);
        assert_eq!(
            task.ports,
            vec![Port {
                protocol: Protocol::Tcp,
                host_port: Some(31001),
                vip: vec!["web.marathon:80".to_string()],
                ..Port::default()
            }]
        );
    }

    #[test]
    fn test_discovery_ports_with_vips_and_scope() {
        let raw = json!({
            "state": "TASK_STAGING",
            "discovery": {"ports": {"ports": [
                {"number": 8080, "protocol": "tcp", "labels": {"labels": [
                    {"key": "VIP_0", "value": "api.marathon:80"},
                ]}},
                {"number": 8081, "protocol": "udp", "name": "stats",
                 "labels": {"labels": [{"key": "network-scope", "value": "host"}]}},
                {"number": 9999, "protocol": "sctp"},
            ]}},
        });
        let task = run_normalize(&raw, None);
        assert_eq!(
            task.ports,
            vec![
                Port {
                    name: Some("default".to_string()),
                    protocol: Protocol::Tcp,
                    port: Some(8080),
                    vip: vec!["api.marathon:80".to_string()],
                    ..Port::default()
                },
                Port {
                    name: Some("stats".to_string()),
                    protocol: Protocol::Udp,
                    host_port: Some(8081),
                    ..Port::default()
                },
            ]
        );
    }

    #[test]
    fn test_matching_ports_merge_across_sources() {
        let raw = json!({
            "state": "TASK_STAGING",
            "container": {
                "type": "DOCKER",
                "docker": {"port_mappings": [
                    {"container_port": 80, "host_port": 31000, "protocol": "tcp"},
                ]},
            },
            "discovery": {"ports": {"ports": [
                {"number": 80, "protocol": "tcp", "name": "http", "labels": {"labels": [
                    {"key": "VIP_0", "value": "web:80"},
                ]}},
            ]}},
        });
        let task = run_normalize(&raw, None);
        assert_eq!(
            task.ports,
            vec![Port {
                name: Some("http".to_string()),
                protocol: Protocol::Tcp,
                port: Some(80),
                host_port: Some(31000),
                vip: vec!["web:80".to_string()],
            }]
        );
    }

    #[test]
    fn test_host_networking_collapses_host_ports() {
        let raw = json!({
            "state": "TASK_RUNNING",
            "statuses": [{
                "timestamp": 1.0,
                "container_status": {"network_infos": [
                    {"ip_addresses": [{"ip_address": "10.0.0.1"}]}
                ]},
            }],
            "discovery": {"ports": {"ports": [
                {"number": 8080, "protocol": "tcp", "labels": {"labels": [
                    {"key": "network-scope", "value": "host"},
                ]}},
            ]}},
        });
        let task = run_normalize(&raw, None);
        assert_eq!(task.ports.len(), 1);
        assert_eq!(task.ports[0].port, Some(8080));
        assert_eq!(task.ports[0].host_port, None);
    }

    #[test]
    fn test_no_collapse_for_preparing_tasks() {
        let raw = json!({
            "state": "TASK_STAGING",
            "statuses": [{
                "timestamp": 1.0,
                "container_status": {"network_infos": [
                    {"ip_addresses": [{"ip_address": "10.0.0.1"}]}
                ]},
            }],
            "discovery": {"ports": {"ports": [
                {"number": 8080, "protocol": "tcp", "labels": {"labels": [
                    {"key": "network-scope", "value": "host"},
                ]}},
            ]}},
        });
        let task = run_normalize(&raw, None);
        assert_eq!(task.ports[0].host_port, Some(8080));
        assert_eq!(task.ports[0].port, None);
    }

    #[test]
    fn test_normalizing_twice_is_stable() {
        let raw = json!({
            "name": "web",
            "state": "TASK_RUNNING",
            "statuses": [{
                "timestamp": 1.0,
                "container_status": {"network_infos": [
                    {"ip_addresses": [{"ip_address": "9.9.9.9"}]}
                ]},
            }],
        });
        let once = run_normalize(&raw, None);
        let twice = run_normalize(&raw, Some(&once));
        assert_eq!(once, twice);
    }
}
