//! Packet events produced by packet sources.

use std::fmt;

use super::FlowKey;
use crate::error::CaptureError;

/// Direction of a packet relative to the observing host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Received by the host
    #[default]
    Inbound,
    /// Sent by the host
    Outbound,
}

/// A single observed packet (or connection event) to be aggregated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Connection attributes
    pub key: FlowKey,
    /// Interface the packet was observed on
    pub iface: String,
    /// Length in bytes; packets never exceed 2^16 - 1 bytes
    pub length: u16,
    /// Direction relative to the host
    pub direction: Direction,
}

impl Packet {
    /// Create a packet event.
    pub fn new(key: FlowKey, iface: impl Into<String>, length: u16, direction: Direction) -> Self {
        Self {
            key,
            iface: iface.into(),
            length,
            direction,
        }
    }

    /// Create a packet from a transport frame length, rejecting frames
    /// that do not fit the 16 bit length field.
    pub fn from_frame(
        key: FlowKey,
        iface: impl Into<String>,
        frame_len: u64,
        direction: Direction,
    ) -> Result<Self, CaptureError> {
        let length = u16::try_from(frame_len).map_err(|_| CaptureError::OversizedFrame(frame_len))?;
        Ok(Self::new(key, iface, length, direction))
    }

}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "iface={}; len={}; {}", self.iface, self.length, self.key)
    }
}
