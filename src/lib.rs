//! mesos-dns-sync - DNS name synchronization from a Mesos operator event
//! stream into a replicated key-value zone store.
//!
//! This crate mirrors the cluster (agents, frameworks, tasks) from the
//! master's operator API, derives DNS resource records from the mirror,
//! and publishes the resulting zone to a key-value sink that downstream
//! resolvers serve from.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        mesos-dns-sync                          │
//! │                                                                │
//! │  ┌────────────────┐ events ┌──────────────┐  pub/sub           │
//! │  │ Operator stream│───────▶│    Mirror    │─────────┐          │
//! │  │ (framed JSON)  │        │ (in-memory)  │         ▼          │
//! │  └────────────────┘        └──────────────┘  ┌──────────────┐  │
//! │          ▲                     agents         │  Projector   │  │
//! │          │ SUBSCRIBE           frameworks     │ (refcounted  │  │
//! │          │ + reconnect        tasks          │   records)   │  │
//! │                                               └──────┬───────┘  │
//! │                                                      │ assign   │
//! │                                                      ▼          │
//! │                                              key-value store    │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The mirror resolves cross-entity references that arrive out of order,
//! gates publication behind readiness phases so a reconnect never mass
//! deletes records, and fans updates out to subscribers with acked
//! backpressure. The projector keeps one reference count per record and
//! debounces bursts into at most one zone push per interval.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mesos_dns_sync::{MemorySink, SyncConfig, SyncServer};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncConfig::default();
//!     let sink = Arc::new(MemorySink::new());
//!     let cancel = CancellationToken::new();
//!     SyncServer::new(config, sink).run(cancel).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod framing;
pub mod metrics;
pub mod mirror;
pub mod projector;
pub mod pubsub;
pub mod records;
pub mod server;
pub mod sink;
pub mod state;
pub mod task;
pub mod telemetry;

// Re-export main types
pub use config::{Config, SoaConfig, SyncConfig, TelemetryConfig};
pub use error::SyncError;
pub use mirror::{Mirror, MirrorHandle};
pub use projector::Projector;
pub use pubsub::{SubscriberTable, Subscription};
pub use records::{DnsRecord, RecordData};
pub use server::SyncServer;
pub use sink::{MemorySink, ZoneRecords, ZoneSink};
pub use state::{MirrorEvent, MirrorState, Phase};
pub use task::{AgentId, FrameworkId, Task, TaskId, TaskState};
