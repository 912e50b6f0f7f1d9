//! Immutable flow table snapshots.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use super::{render_flows, FlowMap};
use crate::domain::{Counters, FlowKey};

/// Point-in-time copy of the flow table, produced at flush or shutdown.
#[derive(Debug, Clone)]
pub struct FlowSnapshot {
    taken_at: SystemTime,
    is_final: bool,
    flows: FlowMap,
}

impl FlowSnapshot {
    pub(crate) fn new(taken_at: SystemTime, is_final: bool, flows: FlowMap) -> Self {
        Self {
            taken_at,
            is_final,
            flows,
        }
    }

    /// Time of the flush trigger that produced this snapshot.
    pub fn taken_at(&self) -> SystemTime {
        self.taken_at
    }

    /// Seconds since the unix epoch of `taken_at`.
    pub fn unix_timestamp(&self) -> u64 {
        self.taken_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Whether this is the last snapshot of an engine run.
    pub fn is_final(&self) -> bool {
        self.is_final
    }

    /// Interface name to flow key to counters.
    pub fn flows(&self) -> &FlowMap {
        &self.flows
    }

    /// Counters of one flow, if present.
    pub fn get(&self, iface: &str, key: &FlowKey) -> Option<&Counters> {
        self.flows.get(iface).and_then(|flows| flows.get(key))
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn interface_count(&self) -> usize {
        self.flows.len()
    }

    pub fn flow_count(&self) -> usize {
        self.flows.values().map(|flows| flows.len()).sum()
    }

    /// Sum of packets in both directions over all flows.
    pub fn total_packets(&self) -> u64 {
        self.flows
            .values()
            .flat_map(|flows| flows.values())
            .fold(0u64, |acc, c| acc.saturating_add(c.total_packets()))
    }

    /// Flattened records sorted by interface and key.
    pub fn records(&self) -> Vec<FlowRecord> {
        let mut records: Vec<_> = self
            .flows
            .iter()
            .flat_map(|(iface, flows)| {
                flows
                    .iter()
                    .map(move |(key, counters)| FlowRecord::new(iface, key, counters))
            })
            .collect();
        records.sort_by(|a, b| (&a.iface, &a.key).cmp(&(&b.iface, &b.key)));
        records
    }

    /// Deterministic textual rendering for diagnostics.
    pub fn render(&self) -> String {
        render_flows(&self.flows)
    }
}

/// One flow of a snapshot in serializable form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowRecord {
    pub iface: String,
    pub src: String,
    pub dst: String,
    pub sport: u16,
    pub dport: u16,
    pub proto: u8,
    pub bytes_rcvd: u64,
    pub bytes_sent: u64,
    pub packets_rcvd: u64,
    pub packets_sent: u64,
    #[serde(skip)]
    key: FlowKey,
}

impl FlowRecord {
    fn new(iface: &str, key: &FlowKey, counters: &Counters) -> Self {
        Self {
            iface: iface.to_string(),
            src: key.src_ip().to_string(),
            dst: key.dst_ip().to_string(),
            sport: key.src_port,
            dport: key.dst_port,
            proto: key.protocol,
            bytes_rcvd: counters.bytes_received,
            bytes_sent: counters.bytes_sent,
            packets_rcvd: counters.packets_received,
            packets_sent: counters.packets_sent,
            key: *key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Direction, Packet};
    use crate::flow::FlowTable;
    use std::time::Duration;

    fn sample() -> FlowSnapshot {
        let table = FlowTable::new();
        let a = FlowKey::new("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap(), 1, 2, 6);
        let b = FlowKey::new("::1".parse().unwrap(), "::1".parse().unwrap(), 3, 4, 17);
        table.update(&Packet::new(a, "eth1", 100, Direction::Outbound));
        table.update(&Packet::new(b, "eth0", 50, Direction::Inbound));
        table.update(&Packet::new(b, "eth0", 50, Direction::Inbound));
        table.snapshot_and_reset(UNIX_EPOCH + Duration::from_secs(1_700_000_000), false)
    }

    #[test]
    fn test_totals() {
        let snap = sample();
        assert_eq!(snap.interface_count(), 2);
        assert_eq!(snap.flow_count(), 2);
        assert_eq!(snap.total_packets(), 3);
        assert_eq!(snap.unix_timestamp(), 1_700_000_000);
        assert!(!snap.is_final());
    }

    #[test]
    fn test_records_sorted_by_interface() {
        let records = sample().records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].iface, "eth0");
        assert_eq!(records[0].src, "::1");
        assert_eq!(records[0].packets_rcvd, 2);
        assert_eq!(records[1].iface, "eth1");
        assert_eq!(records[1].dst, "10.0.0.2");
        assert_eq!(records[1].bytes_sent, 100);
    }

    #[test]
    fn test_record_serializes_without_key() {
        let json = serde_json::to_value(&sample().records()[1]).unwrap();
        assert_eq!(json["proto"], 6);
        assert_eq!(json["sport"], 1);
        assert!(json.get("key").is_none());
    }
}
