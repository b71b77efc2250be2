//! DNS projector: reference-counted records, inverted name index and
//! debounced zone publication.
//!
//! The projector consumes the mirror's subscription feed. Each task
//! contributes a set of records; a record lives in the zone while at
//! least one task still produces it. Bursts of updates collapse into at
//! most one zone push per debounce window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::pubsub::Subscription;
use crate::records::{self, DnsRecord};
use crate::sink::{ZoneRecords, ZoneSink};
use crate::state::MirrorEvent;
use crate::task::{Task, TaskId};

/// Core projection state, independent of timers and the sink.
struct ProjectorState {
    domain: String,
    baseline: Vec<DnsRecord>,
    task_rrs: HashMap<TaskId, Vec<DnsRecord>>,
    refcount: HashMap<DnsRecord, usize>,
    by_name: ZoneRecords,
    masters: Vec<DnsRecord>,
}

impl ProjectorState {
    fn new(config: &SyncConfig) -> Self {
        let baseline = records::zone_records(&config.domain, config.leader_ip, &config.soa);
        let mut by_name = ZoneRecords::new();
        for record in &baseline {
            by_name
                .entry(record.name.clone())
                .or_default()
                .push(record.clone());
        }
        Self {
            domain: config.domain.clone(),
            baseline,
            task_rrs: HashMap::new(),
            refcount: HashMap::new(),
            by_name,
            masters: Vec::new(),
        }
    }

    /// Rebuild everything from a full snapshot. Masters are repopulated by
    /// the refresh timer right after.
    fn rebuild(&mut self, tasks: &HashMap<TaskId, Task>) {
        self.task_rrs.clear();
        self.refcount.clear();
        self.by_name.clear();
        self.masters.clear();
        for record in self.baseline.clone() {
            self.index_insert(record);
        }
        for (id, task) in tasks {
            let task_records = records::task_records(task, &self.domain);
            for record in &task_records {
                self.retain(record.clone());
            }
            if !task_records.is_empty() {
                self.task_rrs.insert(id.clone(), task_records);
            }
        }
    }

    /// Apply one task update; true when any index entry changed.
    fn apply_task(&mut self, id: &TaskId, task: &Task) -> bool {
        let new = if task.state.is_terminal() {
            Vec::new()
        } else {
            records::task_records(task, &self.domain)
        };
        let old = self.task_rrs.get(id).cloned().unwrap_or_default();
        if new == old {
            return false;
        }

        let mut changed = false;
        for record in old.iter().filter(|record| !new.contains(record)) {
            changed |= self.release(record);
        }
        for record in new.iter().filter(|record| !old.contains(record)) {
            changed |= self.retain(record.clone());
        }
        if new.is_empty() {
            self.task_rrs.remove(id);
        } else {
            self.task_rrs.insert(id.clone(), new);
        }
        changed
    }

    /// Replace the master pointer records; true when they differ.
    fn set_masters(&mut self, records: Vec<DnsRecord>) -> bool {
        if records == self.masters {
            return false;
        }
        let old = std::mem::replace(&mut self.masters, records);
        for record in old {
            self.index_remove(&record);
        }
        for record in self.masters.clone() {
            self.index_insert(record);
        }
        true
    }

    /// Drop master records while keeping task records, so a brief
    /// reconnect does not flap the zone.
    fn clear_masters(&mut self) {
        for record in std::mem::take(&mut self.masters) {
            self.index_remove(&record);
        }
    }

    fn retain(&mut self, record: DnsRecord) -> bool {
        let count = self.refcount.entry(record.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.index_insert(record);
            true
        } else {
            false
        }
    }

    fn release(&mut self, record: &DnsRecord) -> bool {
        match self.refcount.get_mut(record) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.refcount.remove(record);
                self.index_remove(record);
                true
            }
            None => false,
        }
    }

    fn index_insert(&mut self, record: DnsRecord) {
        let entry = self.by_name.entry(record.name.clone()).or_default();
        if let Err(pos) = entry.binary_search(&record) {
            entry.insert(pos, record);
        }
    }

    fn index_remove(&mut self, record: &DnsRecord) {
        if let Some(entry) = self.by_name.get_mut(&record.name) {
            entry.retain(|existing| existing != record);
            if entry.is_empty() {
                self.by_name.remove(&record.name);
            }
        }
    }

    fn zone(&self) -> &ZoneRecords {
        &self.by_name
    }
}

/// Zone push coalescing. Tracks a revision counter and whether the
/// debounce timer is armed; pushes happen immediately when idle and at
/// most once per window under load, with the final state guaranteed to go
/// out within one window of the last change.
struct Debounce {
    rev: u64,
    armed: Option<u64>,
}

impl Debounce {
    fn new() -> Self {
        Self { rev: 0, armed: None }
    }

    /// A zone change happened. True means push now and arm the timer.
    fn on_change(&mut self) -> bool {
        self.rev += 1;
        if self.armed.is_none() {
            self.armed = Some(self.rev);
            true
        } else {
            false
        }
    }

    /// The timer fired. True means push the coalesced state and re-arm.
    fn on_timer(&mut self) -> bool {
        match self.armed {
            Some(armed_rev) if armed_rev < self.rev => {
                self.rev += 1;
                self.armed = Some(self.rev);
                true
            }
            _ => {
                self.armed = None;
                false
            }
        }
    }

    fn clear(&mut self) {
        self.armed = None;
    }
}

/// Projects mirror task updates into the DNS zone and pushes it to the
/// sink.
pub struct Projector {
    config: SyncConfig,
    sink: Arc<dyn ZoneSink>,
    state: ProjectorState,
    debounce: Debounce,
}

impl Projector {
    /// Create a projector publishing into `config.domain`.
    pub fn new(config: SyncConfig, sink: Arc<dyn ZoneSink>) -> Self {
        let state = ProjectorState::new(&config);
        Self {
            config,
            sink,
            state,
            debounce: Debounce::new(),
        }
    }

    /// Consume one subscription until the mirror drops it or `cancel`
    /// fires. Projection state survives across calls, so a resubscribe
    /// continues from the retained records.
    pub async fn run(&mut self, mut subscription: Subscription, cancel: CancellationToken) {
        let mut push_deadline: Option<Instant> = None;
        let mut masters_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("projector shutting down");
                    return;
                }

                _ = tokio::time::sleep_until(push_deadline.unwrap_or_else(Instant::now)),
                    if push_deadline.is_some() =>
                {
                    if self.debounce.on_timer() {
                        self.push_zone().await;
                        push_deadline = Some(Instant::now() + self.config.push_zone_timeout());
                    } else {
                        push_deadline = None;
                    }
                }

                _ = tokio::time::sleep_until(masters_deadline.unwrap_or_else(Instant::now)),
                    if masters_deadline.is_some() =>
                {
                    masters_deadline = Some(Instant::now() + self.config.masters_timeout());
                    if self.refresh_masters() {
                        debug!("master records changed");
                        self.note_change(&mut push_deadline).await;
                    }
                }

                event = subscription.next() => match event {
                    None => {
                        warn!("mirror closed the subscription");
                        return;
                    }
                    Some(MirrorEvent::Tasks(snapshot)) => {
                        info!(tasks = snapshot.len(), "rebuilding zone from full snapshot");
                        self.state.rebuild(&snapshot);
                        self.refresh_masters();
                        self.note_change(&mut push_deadline).await;
                        masters_deadline = Some(Instant::now() + self.config.masters_timeout());
                    }
                    Some(MirrorEvent::TaskUpdated { id, task }) => {
                        if self.state.apply_task(&id, &task) {
                            self.note_change(&mut push_deadline).await;
                        }
                    }
                    Some(MirrorEvent::Eos) => {
                        debug!("stream ended; retaining task records until the next snapshot");
                        push_deadline = None;
                        masters_deadline = None;
                        self.debounce.clear();
                        self.state.clear_masters();
                    }
                }
            }
        }
    }

    /// Current zone contents.
    pub fn zone(&self) -> &ZoneRecords {
        self.state.zone()
    }

    async fn note_change(&mut self, push_deadline: &mut Option<Instant>) {
        if self.debounce.on_change() {
            self.push_zone().await;
            *push_deadline = Some(Instant::now() + self.config.push_zone_timeout());
        }
    }

    fn refresh_masters(&mut self) -> bool {
        let masters = records::master_records(&self.config.domain, &self.config.resolvers);
        self.state.set_masters(masters)
    }

    async fn push_zone(&self) {
        push_zone(self.sink.as_ref(), &self.config.domain, self.state.zone()).await;
    }
}

/// Push a zone to a sink, stamped with the current wall clock.
pub async fn push_zone(sink: &dyn ZoneSink, zone: &str, records: &ZoneRecords) {
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0);
    debug!(zone, names = records.len(), "pushing zone");
    sink.assign(zone, records, timestamp_ms).await;
}
