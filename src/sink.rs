//! Zone sink abstraction over the replicated key-value store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::records::DnsRecord;

/// Records of one zone, keyed by owner name.
pub type ZoneRecords = BTreeMap<String, Vec<DnsRecord>>;

/// Destination for derived zones. Assignments replace the whole zone and
/// are last-writer-wins by timestamp, so retries and duplicate pushes are
/// harmless.
#[async_trait]
pub trait ZoneSink: Send + Sync {
    /// Replace the contents of `zone`.
    async fn assign(&self, zone: &str, records: &ZoneRecords, timestamp_ms: u64);
}

/// In-process sink keeping the latest assignment per zone. Stands in for
/// the replicated store in tests and single-node setups.
#[derive(Debug, Default)]
pub struct MemorySink {
    zones: RwLock<HashMap<String, (ZoneRecords, u64)>>,
    assigns: AtomicU64,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest records assigned to a zone.
    pub fn zone(&self, name: &str) -> Option<ZoneRecords> {
        self.zones.read().get(name).map(|(records, _)| records.clone())
    }

    /// Total number of `assign` calls, across all zones.
    pub fn assign_count(&self) -> u64 {
        self.assigns.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ZoneSink for MemorySink {
    async fn assign(&self, zone: &str, records: &ZoneRecords, timestamp_ms: u64) {
        self.assigns.fetch_add(1, Ordering::Relaxed);
        let mut zones = self.zones.write();
        match zones.get(zone) {
            // Last writer wins; ignore stale timestamps.
            Some((_, latest)) if *latest > timestamp_ms => {}
            _ => {
                zones.insert(zone.to_string(), (records.clone(), timestamp_ms));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::RecordData;

    fn record(name: &str, ip: &str) -> DnsRecord {
        DnsRecord {
            name: name.to_string(),
            data: RecordData::A(ip.parse().unwrap()),
        }
    }

    #[tokio::test]
    async fn test_keeps_the_latest_assignment() {
        let sink = MemorySink::new();
        let mut first = ZoneRecords::new();
        first.insert("a.zone".to_string(), vec![record("a.zone", "10.0.0.1")]);
        let mut second = ZoneRecords::new();
        second.insert("a.zone".to_string(), vec![record("a.zone", "10.0.0.2")]);

        sink.assign("zone", &first, 1).await;
        sink.assign("zone", &second, 2).await;

        assert_eq!(sink.zone("zone"), Some(second));
        assert_eq!(sink.assign_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_timestamps_are_ignored() {
        let sink = MemorySink::new();
        let mut newer = ZoneRecords::new();
        newer.insert("a.zone".to_string(), vec![record("a.zone", "10.0.0.2")]);

        sink.assign("zone", &newer, 10).await;
        sink.assign("zone", &ZoneRecords::new(), 5).await;

        assert_eq!(sink.zone("zone"), Some(newer));
    }
}
