//! Connection attributes identifying a flow.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Length of the canonical address field.
const ADDR_LEN: usize = 16;

/// Store an address in its canonical 16 byte form.
///
/// IPv4 occupies bytes 0..4 and leaves the high bytes zero.
pub fn canonical_addr(addr: IpAddr) -> [u8; ADDR_LEN] {
    let mut out = [0u8; ADDR_LEN];
    match addr {
        IpAddr::V4(v4) => out[..4].copy_from_slice(&v4.octets()),
        IpAddr::V6(v6) => out = v6.octets(),
    }
    out
}

/// Connection attributes of a packet: the flow key within an interface.
///
/// Equality is exact byte-for-byte comparison of every field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FlowKey {
    /// Source address, canonical 16 byte form
    pub src_addr: [u8; ADDR_LEN],
    /// Destination address, canonical 16 byte form
    pub dst_addr: [u8; ADDR_LEN],
    /// Source port (zero when the transport has none)
    pub src_port: u16,
    /// Destination port (zero when the transport has none)
    pub dst_port: u16,
    /// Transport protocol number
    pub protocol: u8,
}

impl FlowKey {
    /// Build a key from typed addresses.
    pub fn new(src: IpAddr, dst: IpAddr, src_port: u16, dst_port: u16, protocol: u8) -> Self {
        Self {
            src_addr: canonical_addr(src),
            dst_addr: canonical_addr(dst),
            src_port,
            dst_port,
            protocol,
        }
    }

    /// Source address as a typed address.
    pub fn src_ip(&self) -> IpAddr {
        raw_to_ip(&self.src_addr)
    }

    /// Destination address as a typed address.
    pub fn dst_ip(&self) -> IpAddr {
        raw_to_ip(&self.dst_addr)
    }
}

/// Interpret a canonical address: all-zero high bytes mean IPv4.
fn raw_to_ip(raw: &[u8; ADDR_LEN]) -> IpAddr {
    if raw[4..].iter().all(|b| *b == 0) {
        IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))
    } else {
        IpAddr::V6(Ipv6Addr::from(*raw))
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "proto={}; {}.{} -> {}.{}",
            self.protocol,
            self.src_ip(),
            self.src_port,
            self.dst_ip(),
            self.dst_port
        )
    }
}
