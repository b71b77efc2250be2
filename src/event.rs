//! Operator API event envelope and JSON path helpers.

use serde_json::Value;

use crate::error::SyncError;

/// Event kinds emitted by the master operator API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Initial snapshot plus the heartbeat interval.
    Subscribed,
    /// Liveness beacon; re-arms the watchdog.
    Heartbeat,
    /// A new task was launched.
    TaskAdded,
    /// A task changed status.
    TaskUpdated,
    /// A framework registered.
    FrameworkAdded,
    /// A framework reregistered or changed.
    FrameworkUpdated,
    /// A framework was torn down.
    FrameworkRemoved,
    /// An agent registered.
    AgentAdded,
    /// An agent was removed.
    AgentRemoved,
    /// Anything we do not recognize; logged and ignored.
    Unknown(String),
}

impl EventKind {
    fn from_type(kind: &str) -> Self {
        match kind {
            "SUBSCRIBED" => Self::Subscribed,
            "HEARTBEAT" => Self::Heartbeat,
            "TASK_ADDED" => Self::TaskAdded,
            "TASK_UPDATED" => Self::TaskUpdated,
            "FRAMEWORK_ADDED" => Self::FrameworkAdded,
            "FRAMEWORK_UPDATED" => Self::FrameworkUpdated,
            "FRAMEWORK_REMOVED" => Self::FrameworkRemoved,
            "AGENT_ADDED" => Self::AgentAdded,
            "AGENT_REMOVED" => Self::AgentRemoved,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// A decoded operator event: its kind plus the raw payload object.
///
/// Payload fields are pulled lazily by the handlers so that one malformed
/// field never poisons the rest of the event.
#[derive(Debug, Clone)]
pub struct RawEvent {
    /// Parsed event kind.
    pub kind: EventKind,
    /// The full event object as received.
    pub payload: Value,
}

impl RawEvent {
    /// Wrap a decoded frame. Fails if the object carries no `type` field,
    /// which means the stream itself is corrupt.
    pub fn from_value(payload: Value) -> Result<Self, SyncError> {
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .map(EventKind::from_type)
            .ok_or_else(|| SyncError::BadFrame("event without a type field".into()))?;
        Ok(Self { kind, payload })
    }
}

/// Walk a path of object keys.
pub(crate) fn get_in<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    Some(current)
}

/// Walk a path and read a string leaf.
pub(crate) fn get_str<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    get_in(value, path).and_then(Value::as_str)
}

/// Read a Mesos-style id object (`{"value": "..."}`) at the given path.
pub(crate) fn get_id(value: &Value, path: &[&str]) -> Option<String> {
    let id = get_in(value, path)?;
    id.get("value").and_then(Value::as_str).map(str::to_string)
}

/// Walk a path and read an array leaf, defaulting to empty.
pub(crate) fn get_array<'a>(value: &'a Value, path: &[&str]) -> &'a [Value] {
    get_in(value, path)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}
