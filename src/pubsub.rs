//! Fan-out of mirror messages with per-subscriber acknowledgement.
//!
//! The mirror delivers a message to every subscriber and then waits for
//! each one's acknowledgement, which a subscriber sends implicitly by
//! asking for the next message. Slow consumers therefore slow the stream
//! reader down instead of accumulating unbounded backlog; consumers that
//! stop acking entirely are killed so they cannot stall the heartbeat
//! watchdog.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::metrics;
use crate::state::MirrorEvent;

const CHANNEL_CAPACITY: usize = 16;

/// Consumer side of a mirror subscription.
pub struct Subscription {
    name: String,
    events: mpsc::Receiver<MirrorEvent>,
    acks: mpsc::Sender<()>,
    pending_ack: bool,
}

impl Subscription {
    /// Receive the next mirror message, acknowledging the previous one.
    /// Returns `None` once the mirror has dropped this subscriber.
    pub async fn next(&mut self) -> Option<MirrorEvent> {
        if self.pending_ack {
            self.pending_ack = false;
            if self.acks.send(()).await.is_err() {
                return None;
            }
        }
        let event = self.events.recv().await?;
        self.pending_ack = true;
        Some(event)
    }

    /// Name this subscription was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }
}

struct SubscriberSlot {
    events: mpsc::Sender<MirrorEvent>,
    acks: mpsc::Receiver<()>,
}

/// Publisher-side registry of subscribers.
#[derive(Default)]
pub struct SubscriberTable {
    subscribers: HashMap<String, SubscriberSlot>,
}

impl SubscriberTable {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Names are unique; a second subscription
    /// under a live name is an error.
    pub fn subscribe(&mut self, name: &str) -> Result<Subscription, SyncError> {
        if self.subscribers.contains_key(name) {
            return Err(SyncError::AlreadySubscribed(name.to_string()));
        }
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (ack_tx, ack_rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.subscribers.insert(
            name.to_string(),
            SubscriberSlot {
                events: event_tx,
                acks: ack_rx,
            },
        );
        debug!(subscriber = name, "subscribed");
        Ok(Subscription {
            name: name.to_string(),
            events: event_rx,
            acks: ack_tx,
            pending_ack: false,
        })
    }

    /// Number of live subscribers.
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Whether any subscriber is registered.
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Deliver one message to every subscriber and wait for each ack.
    /// Subscribers that died or blew the ack timeout are removed.
    pub async fn publish(&mut self, event: &MirrorEvent, ack_timeout: Duration) {
        if self.subscribers.is_empty() {
            return;
        }
        let started = Instant::now();
        let mut dead = Vec::new();
        for (name, slot) in &mut self.subscribers {
            if slot.events.send(event.clone()).await.is_err() {
                debug!(subscriber = %name, "subscriber dropped its subscription");
                dead.push(name.clone());
                continue;
            }
            match timeout(ack_timeout, slot.acks.recv()).await {
                Ok(Some(())) => {}
                Ok(None) => {
                    debug!(subscriber = %name, "subscriber dropped its subscription");
                    dead.push(name.clone());
                }
                Err(_) => {
                    warn!(
                        subscriber = %name,
                        timeout_ms = ack_timeout.as_millis() as u64,
                        "subscriber failed to acknowledge in time; terminating it"
                    );
                    dead.push(name.clone());
                }
            }
        }
        for name in dead {
            self.subscribers.remove(&name);
        }
        metrics::record_pubsub_duration(started.elapsed());
    }
}
