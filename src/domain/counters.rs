//! Per-flow directional counters.

use std::fmt;

use super::{Direction, Packet};

/// Byte and packet totals of one flow, split by direction.
///
/// Accumulators saturate at `u64::MAX` instead of wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counters {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub packets_sent: u64,
}

impl Counters {
    /// Account one packet on the side chosen by its direction.
    ///
    /// Returns `false` if an accumulator hit its bound.
    pub fn apply(&mut self, packet: &Packet) -> bool {
        let (bytes, packets) = match packet.direction {
            Direction::Outbound => (&mut self.bytes_sent, &mut self.packets_sent),
            Direction::Inbound => (&mut self.bytes_received, &mut self.packets_received),
        };
        let (new_bytes, bytes_overflow) = bytes.overflowing_add(u64::from(packet.length));
        let (new_packets, packets_overflow) = packets.overflowing_add(1);
        *bytes = if bytes_overflow { u64::MAX } else { new_bytes };
        *packets = if packets_overflow { u64::MAX } else { new_packets };
        !(bytes_overflow || packets_overflow)
    }

    /// Total packets in both directions.
    pub fn total_packets(&self) -> u64 {
        self.packets_received.saturating_add(self.packets_sent)
    }
}

impl fmt::Display for Counters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bytes: RX={} TX={}; Packets: RX={} TX={}",
            self.bytes_received, self.bytes_sent, self.packets_received, self.packets_sent
        )
    }
}
