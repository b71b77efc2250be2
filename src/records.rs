//! DNS record construction from normalized tasks.
//!
//! Every task contributes records under three synthetic names inside the
//! zone: `agentip` (where the task's agent lives), `containerip` (the
//! container addresses) and `autoip` (the address a client should
//! actually dial, picked from the other two).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::config::SoaConfig;
use crate::task::{Ref, Task};

/// Record payload; the variant determines the record type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordData {
    /// IPv4 address record.
    A(Ipv4Addr),
    /// IPv6 address record.
    Aaaa(Ipv6Addr),
    /// Delegation record.
    Ns(String),
    /// Start of authority.
    Soa {
        /// Primary nameserver.
        mname: String,
        /// Admin contact in DNS format.
        rname: String,
    },
}

impl RecordData {
    /// Record type mnemonic.
    pub fn rtype(&self) -> &'static str {
        match self {
            Self::A(_) => "A",
            Self::Aaaa(_) => "AAAA",
            Self::Ns(_) => "NS",
            Self::Soa { .. } => "SOA",
        }
    }
}

/// A DNS resource record, value-equal and hashable by all fields so it can
/// key the projector's refcount map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DnsRecord {
    /// Fully qualified owner name, canonical lowercase.
    pub name: String,
    /// Record payload.
    pub data: RecordData,
}

impl DnsRecord {
    /// Address record of the appropriate family.
    pub fn address(name: String, ip: IpAddr) -> Self {
        let data = match ip {
            IpAddr::V4(ip) => RecordData::A(ip),
            IpAddr::V6(ip) => RecordData::Aaaa(ip),
        };
        Self { name, data }
    }
}

/// Lowercase a label and squeeze everything outside `[a-z0-9-]` into
/// single hyphens, trimming hyphens from the ends.
pub fn normalize_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut pending_hyphen = false;
    for c in label.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c);
        } else {
            pending_hyphen = true;
        }
    }
    out
}

/// Records contributed by one publishable task. Tasks without a name or a
/// resolved framework name contribute nothing.
pub fn task_records(task: &Task, domain: &str) -> Vec<DnsRecord> {
    let Some(name) = task.name.as_deref() else {
        return Vec::new();
    };
    let Some(framework) = task.framework.as_ref().and_then(Ref::resolved) else {
        return Vec::new();
    };
    let task_label = normalize_label(name);
    let framework_label = normalize_label(framework);
    if task_label.is_empty() || framework_label.is_empty() {
        return Vec::new();
    }
    let basename = format!("{task_label}.{framework_label}");
    let agent_ip = task.agent_ip.as_ref().and_then(Ref::resolved).copied();

    let mut records = Vec::new();
    if let Some(ip) = agent_ip {
        records.push(DnsRecord::address(
            format!("{basename}.agentip.{domain}"),
            IpAddr::V4(ip),
        ));
    }
    for &ip in &task.task_ip {
        records.push(DnsRecord::address(
            format!("{basename}.containerip.{domain}"),
            ip,
        ));
    }

    let autoip_name = format!("{basename}.autoip.{domain}");
    let uses_host_port = task.ports.iter().any(|p| p.host_port.is_some());
    if uses_host_port || task.task_ip.is_empty() {
        if let Some(ip) = agent_ip {
            records.push(DnsRecord::address(autoip_name, IpAddr::V4(ip)));
        }
    } else {
        for &ip in &task.task_ip {
            records.push(DnsRecord::address(autoip_name.clone(), ip));
        }
    }

    records.sort();
    records.dedup();
    records
}

/// Zone-wide baseline records: SOA, NS and the leader pointer.
pub fn zone_records(domain: &str, leader_ip: Option<Ipv4Addr>, soa: &SoaConfig) -> Vec<DnsRecord> {
    let mut records = vec![
        DnsRecord {
            name: domain.to_string(),
            data: RecordData::Soa {
                mname: soa.mname.clone(),
                rname: soa.rname.clone(),
            },
        },
        DnsRecord {
            name: domain.to_string(),
            data: RecordData::Ns(soa.mname.clone()),
        },
    ];
    if let Some(ip) = leader_ip {
        records.push(DnsRecord {
            name: format!("leader.{domain}"),
            data: RecordData::A(ip),
        });
    }
    records
}

/// Master pointer records, one A record per configured master.
pub fn master_records(domain: &str, masters: &[Ipv4Addr]) -> Vec<DnsRecord> {
    let name = format!("master.{domain}");
    let mut records: Vec<DnsRecord> = masters
        .iter()
        .map(|&ip| DnsRecord {
            name: name.clone(),
            data: RecordData::A(ip),
        })
        .collect();
    records.sort();
    records.dedup();
    records
}
