//! Configuration types for mesos-dns-sync.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Sync pipeline configuration.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Mirror and projector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the leading master's operator API.
    #[serde(default = "default_master_url")]
    pub master_url: String,

    /// DNS zone under which derived records are published.
    #[serde(default = "default_domain")]
    pub domain: String,

    /// IP of this node, published as `leader.<domain>`.
    #[serde(default)]
    pub leader_ip: Option<Ipv4Addr>,

    /// Master IPs published as `master.<domain>` A records.
    #[serde(default)]
    pub resolvers: Vec<Ipv4Addr>,

    /// Minimum reconnect backoff in milliseconds.
    #[serde(default = "default_reconnect_timeout_ms")]
    pub reconnect_timeout_ms: u64,

    /// Maximum reconnect backoff in milliseconds.
    #[serde(default = "default_reconnect_max_timeout_ms")]
    pub reconnect_max_timeout_ms: u64,

    /// How long to wait for recovered agents to reregister before serving.
    #[serde(default = "default_agents_readiness_timeout_ms")]
    pub agents_readiness_timeout_ms: u64,

    /// How long to let task status catch up before serving.
    #[serde(default = "default_tasks_readiness_timeout_ms")]
    pub tasks_readiness_timeout_ms: u64,

    /// Interval between master record refreshes in milliseconds.
    #[serde(default = "default_masters_timeout_ms")]
    pub masters_timeout_ms: u64,

    /// Minimum gap between successive zone pushes in milliseconds.
    #[serde(default = "default_push_zone_timeout_ms")]
    pub push_zone_timeout_ms: u64,

    /// SOA record configuration.
    #[serde(default)]
    pub soa: SoaConfig,
}

impl SyncConfig {
    /// Minimum reconnect backoff.
    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    /// Maximum reconnect backoff.
    pub fn reconnect_max_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_timeout_ms)
    }

    /// Recovered-agents readiness window.
    pub fn agents_readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.agents_readiness_timeout_ms)
    }

    /// Task status catch-up readiness window.
    pub fn tasks_readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.tasks_readiness_timeout_ms)
    }

    /// Master record refresh interval.
    pub fn masters_timeout(&self) -> Duration {
        Duration::from_millis(self.masters_timeout_ms)
    }

    /// Zone push debounce interval.
    pub fn push_zone_timeout(&self) -> Duration {
        Duration::from_millis(self.push_zone_timeout_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            master_url: default_master_url(),
            domain: default_domain(),
            leader_ip: None,
            resolvers: Vec::new(),
            reconnect_timeout_ms: default_reconnect_timeout_ms(),
            reconnect_max_timeout_ms: default_reconnect_max_timeout_ms(),
            agents_readiness_timeout_ms: default_agents_readiness_timeout_ms(),
            tasks_readiness_timeout_ms: default_tasks_readiness_timeout_ms(),
            masters_timeout_ms: default_masters_timeout_ms(),
            push_zone_timeout_ms: default_push_zone_timeout_ms(),
            soa: SoaConfig::default(),
        }
    }
}

fn default_master_url() -> String {
    "http://leader.mesos:5050".to_string()
}

fn default_domain() -> String {
    "dcos.thisdcos.directory".to_string()
}

fn default_reconnect_timeout_ms() -> u64 {
    2000
}

fn default_reconnect_max_timeout_ms() -> u64 {
    30000
}

fn default_agents_readiness_timeout_ms() -> u64 {
    600_000
}

fn default_tasks_readiness_timeout_ms() -> u64 {
    10_000
}

fn default_masters_timeout_ms() -> u64 {
    5000
}

fn default_push_zone_timeout_ms() -> u64 {
    1000
}

/// SOA (Start of Authority) record configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoaConfig {
    /// Primary nameserver hostname.
    #[serde(default = "default_mname")]
    pub mname: String,

    /// Admin contact in DNS format.
    #[serde(default = "default_rname")]
    pub rname: String,
}

impl Default for SoaConfig {
    fn default() -> Self {
        Self {
            mname: default_mname(),
            rname: default_rname(),
        }
    }
}

fn default_mname() -> String {
    "ns.spartan".to_string()
}

fn default_rname() -> String {
    "support.mesosphere.com".to_string()
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "mesos_dns_sync=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
