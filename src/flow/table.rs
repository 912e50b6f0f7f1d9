//! Concurrent flow table.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use tracing::warn;

use super::{render_flows, FlowMap, FlowSnapshot};
use crate::domain::{Counters, Packet};

/// Flow table keyed by interface and connection attributes.
///
/// Every operation holds the single table lock for its whole duration, so
/// an `update` is ordered entirely before or entirely after any
/// `snapshot_and_reset`.
#[derive(Debug, Default)]
pub struct FlowTable {
    flows: Mutex<FlowMap>,
}

impl FlowTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    // The map only holds plain counters, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, FlowMap> {
        self.flows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Account a packet, creating the interface map and flow on first sight.
    pub fn update(&self, packet: &Packet) {
        let mut flows = self.lock();

        let counters = flows
            .entry(packet.iface.clone())
            .or_default()
            .entry(packet.key)
            .or_insert_with(Counters::default);
        if !counters.apply(packet) {
            warn!(
                "Counter saturated for flow {} on {}; totals are capped at u64::MAX",
                packet.key, packet.iface
            );
        }
    }

    /// Take the current generation and leave an empty table behind.
    pub fn snapshot_and_reset(&self, taken_at: SystemTime, is_final: bool) -> FlowSnapshot {
        let flows = std::mem::take(&mut *self.lock());
        FlowSnapshot::new(taken_at, is_final, flows)
    }

    /// Number of tracked flows across all interfaces.
    pub fn flow_count(&self) -> usize {
        self.lock().values().map(|flows| flows.len()).sum()
    }

    /// Whether the table holds no flows.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Diagnostic rendering of the current generation.
    pub fn render(&self) -> String {
        render_flows(&self.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Direction, FlowKey};
    use std::net::IpAddr;
    use std::sync::Arc;
    use std::thread;

    fn key(src: &str, dst: &str, sport: u16, dport: u16, proto: u8) -> FlowKey {
        FlowKey::new(
            src.parse::<IpAddr>().unwrap(),
            dst.parse::<IpAddr>().unwrap(),
            sport,
            dport,
            proto,
        )
    }

    fn packet(key: FlowKey, iface: &str, length: u16, direction: Direction) -> Packet {
        Packet::new(key, iface, length, direction)
    }

    mod aggregation_tests {
        use super::*;

        #[test]
        fn sums_per_direction_for_one_flow() {
            let table = FlowTable::new();
            let k = key("10.0.0.1", "10.0.0.2", 40000, 80, 6);
            let lengths = [60u16, 1500, 40, 576];
            for len in lengths {
                table.update(&packet(k, "eth0", len, Direction::Outbound));
            }
            for len in [100u16, 200] {
                table.update(&packet(k, "eth0", len, Direction::Inbound));
            }

            let snap = table.snapshot_and_reset(SystemTime::now(), false);
            let counters = snap.get("eth0", &k).unwrap();
            assert_eq!(counters.bytes_sent, 60 + 1500 + 40 + 576);
            assert_eq!(counters.packets_sent, 4);
            assert_eq!(counters.bytes_received, 300);
            assert_eq!(counters.packets_received, 2);
        }

        #[test]
        fn unrelated_flows_unaffected() {
            let table = FlowTable::new();
            let a = key("10.0.0.1", "10.0.0.2", 1, 2, 6);
            let b = key("10.0.0.1", "10.0.0.2", 1, 2, 17);
            table.update(&packet(a, "eth0", 10, Direction::Outbound));
            table.update(&packet(a, "eth1", 20, Direction::Outbound));
            table.update(&packet(b, "eth0", 30, Direction::Inbound));

            let snap = table.snapshot_and_reset(SystemTime::now(), false);
            assert_eq!(snap.flow_count(), 3);
            assert_eq!(snap.get("eth0", &a).unwrap().bytes_sent, 10);
            assert_eq!(snap.get("eth1", &a).unwrap().bytes_sent, 20);
            assert_eq!(snap.get("eth0", &b).unwrap().bytes_received, 30);
            assert_eq!(snap.get("eth0", &b).unwrap().bytes_sent, 0);
        }

        #[test]
        fn interface_map_created_on_first_packet_only() {
            let table = FlowTable::new();
            let a = key("10.0.0.1", "10.0.0.2", 1, 2, 6);
            let b = key("10.0.0.3", "10.0.0.4", 3, 4, 6);
            assert!(table.is_empty());

            table.update(&packet(a, "eth0", 10, Direction::Inbound));
            table.update(&packet(b, "eth0", 20, Direction::Inbound));
            table.update(&packet(a, "eth0", 30, Direction::Inbound));

            let snap = table.snapshot_and_reset(SystemTime::now(), false);
            assert_eq!(snap.interface_count(), 1);
            assert_eq!(snap.flow_count(), 2);
            assert_eq!(snap.get("eth0", &a).unwrap().bytes_received, 40);
            assert_eq!(snap.get("eth0", &a).unwrap().packets_received, 2);
            assert_eq!(snap.get("eth0", &b).unwrap().bytes_received, 20);
        }

        #[test]
        fn every_single_field_discriminates() {
            let base = key("10.0.0.1", "10.0.0.2", 1000, 2000, 6);
            let mut variants = vec![base];

            let mut v = base;
            v.src_addr[3] = 9;
            variants.push(v);
            let mut v = base;
            v.dst_addr[3] = 9;
            variants.push(v);
            let mut v = base;
            v.src_port = 1001;
            variants.push(v);
            let mut v = base;
            v.dst_port = 2001;
            variants.push(v);
            let mut v = base;
            v.protocol = 17;
            variants.push(v);
            // differs only in the bytes a v4 address leaves zero
            let mut v = base;
            v.src_addr[12] = 1;
            variants.push(v);

            let table = FlowTable::new();
            for k in &variants {
                table.update(&packet(*k, "eth0", 1, Direction::Inbound));
            }
            assert_eq!(table.flow_count(), variants.len());
        }
    }

    mod snapshot_tests {
        use super::*;

        #[test]
        fn reset_leaves_empty_table() {
            let table = FlowTable::new();
            table.update(&packet(FlowKey::default(), "eth0", 1, Direction::Inbound));
            let snap = table.snapshot_and_reset(SystemTime::now(), false);
            assert_eq!(snap.flow_count(), 1);
            assert!(table.is_empty());
        }

        #[test]
        fn empty_flush_is_idempotent() {
            let table = FlowTable::new();
            for _ in 0..3 {
                let snap = table.snapshot_and_reset(SystemTime::now(), false);
                assert!(snap.is_empty());
                assert_eq!(snap.interface_count(), 0);
            }
        }

        #[test]
        fn concurrent_updates_land_in_exactly_one_generation() {
            const WRITERS: usize = 8;
            const PER_WRITER: usize = 5_000;

            let table = Arc::new(FlowTable::new());
            let k = key("192.168.0.1", "192.168.0.2", 5, 6, 6);

            let writers: Vec<_> = (0..WRITERS)
                .map(|_| {
                    let table = Arc::clone(&table);
                    thread::spawn(move || {
                        for _ in 0..PER_WRITER {
                            table.update(&packet(k, "eth0", 1, Direction::Outbound));
                        }
                    })
                })
                .collect();

            let snapshotter = {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    let mut taken = Vec::new();
                    for _ in 0..50 {
                        taken.push(table.snapshot_and_reset(SystemTime::now(), false));
                        thread::yield_now();
                    }
                    taken
                })
            };

            for w in writers {
                w.join().unwrap();
            }
            let snapshots = snapshotter.join().unwrap();
            let remainder = table.snapshot_and_reset(SystemTime::now(), true);

            let counted: u64 = snapshots
                .iter()
                .chain(std::iter::once(&remainder))
                .filter_map(|s| s.get("eth0", &k))
                .map(|c| {
                    // one packet of length 1 means bytes track packets exactly
                    assert_eq!(c.bytes_sent, c.packets_sent);
                    c.packets_sent
                })
                .sum();
            assert_eq!(counted, (WRITERS * PER_WRITER) as u64);
        }
    }

    mod render_tests {
        use super::*;

        #[test]
        fn render_is_sorted_and_stable() {
            let table = FlowTable::new();
            let a = key("10.0.0.1", "10.0.0.2", 1, 2, 6);
            let b = key("10.0.0.3", "10.0.0.4", 3, 4, 17);
            table.update(&packet(b, "wlan0", 5, Direction::Inbound));
            table.update(&packet(a, "eth0", 7, Direction::Outbound));
            table.update(&packet(b, "eth0", 9, Direction::Inbound));

            let expected = "eth0:\n\
                \tproto=6; 10.0.0.1.1 -> 10.0.0.2.2; Bytes: RX=0 TX=7; Packets: RX=0 TX=1\n\
                \tproto=17; 10.0.0.3.3 -> 10.0.0.4.4; Bytes: RX=9 TX=0; Packets: RX=1 TX=0\n\
                \n\
                wlan0:\n\
                \tproto=17; 10.0.0.3.3 -> 10.0.0.4.4; Bytes: RX=5 TX=0; Packets: RX=1 TX=0\n\
                \n";
            assert_eq!(table.render(), expected);
            assert_eq!(table.render(), table.render());
        }

        #[test]
        fn render_empty() {
            assert_eq!(FlowTable::new().render(), "");
        }
    }
}
