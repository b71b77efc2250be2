//! Metrics instrumentation for mesos-dns-sync.
//!
//! Metric names are part of the operational contract; dashboards key on
//! them, so keep them stable.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

/// Count raw bytes received from the operator stream.
pub fn record_bytes(count: usize) {
    counter!("bytes_total").increment(count as u64);
}

/// Count one decoded operator message.
pub fn record_message() {
    counter!("messages_total").increment(1);
}

/// Count one failed SUBSCRIBE attempt.
pub fn record_failure() {
    counter!("failures_total").increment(1);
}

/// Whether a stream to the leading master is currently established.
pub fn set_is_leader(is_leader: bool) {
    gauge!("is_leader").set(if is_leader { 1.0 } else { 0.0 });
}

/// Time spent fanning one message out to subscribers.
pub fn record_pubsub_duration(duration: Duration) {
    histogram!("pubsub_duration_seconds").record(duration.as_secs_f64());
}

/// Mirror table sizes.
pub fn record_state_counts(agents: usize, frameworks: usize, tasks: usize, waiting_tasks: usize) {
    gauge!("agents_total").set(agents as f64);
    gauge!("frameworks_total").set(frameworks as f64);
    gauge!("tasks_total").set(tasks as f64);
    gauge!("waiting_tasks_total").set(waiting_tasks as f64);
}
