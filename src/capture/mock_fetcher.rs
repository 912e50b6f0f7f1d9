//! Synthetic packet source.

use std::net::{IpAddr, Ipv6Addr};
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};

use super::listener::{stop_all, ListenerHandle, SourceHealth};
use super::{exhausted_stream, PacketFetcher, PacketStream};
use crate::domain::{canonical_addr, Direction, FlowKey, Packet};
use crate::error::CaptureError;

/// Interface every scripted packet is observed on.
const SCRIPT_IFACE: &str = "eth0";
/// Packets per round of the script.
const PACKETS_PER_ROUND: u8 = 10;
/// Length of every scripted packet.
const SCRIPT_PACKET_LEN: u16 = 10;

/// The reproducible packet script of one listener.
///
/// Two rounds of ten packets on `eth0`. Packet `i` has source and
/// destination `::1`, source port `i`, destination port `15 - i`, protocol
/// `i` and length 10. The first round is inbound, the second outbound, so
/// every key ends with one packet in each direction.
pub fn script() -> Vec<Packet> {
    let loopback = canonical_addr(IpAddr::V6(Ipv6Addr::LOCALHOST));

    [Direction::Inbound, Direction::Outbound]
        .into_iter()
        .flat_map(|direction| {
            (0..PACKETS_PER_ROUND).map(move |i| {
                let key = FlowKey {
                    src_addr: loopback,
                    dst_addr: loopback,
                    src_port: u16::from(i),
                    dst_port: u16::from(15 - i),
                    protocol: i,
                };
                Packet::new(key, SCRIPT_IFACE, SCRIPT_PACKET_LEN, direction)
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
enum Replay {
    Once,
    Endless { pace: Duration },
}

/// Packet source that replays `script()` without touching the system.
///
/// Used for validating aggregation, flush and shutdown behavior.
pub struct MockPacketFetcher {
    listeners: usize,
    replay: Replay,
    available: bool,
    opened: bool,
    fetched: bool,
    running: Vec<ListenerHandle>,
    health: SourceHealth,
}

impl MockPacketFetcher {
    /// One listener publishing the script once.
    pub fn new() -> Self {
        Self {
            listeners: 1,
            replay: Replay::Once,
            available: true,
            opened: false,
            fetched: false,
            running: Vec::new(),
            health: SourceHealth::new(),
        }
    }

    /// A source whose `open` always fails with `SourceUnavailable`.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    /// Number of concurrent listeners, each replaying the script.
    pub fn with_listeners(mut self, listeners: usize) -> Self {
        self.listeners = listeners.max(1);
        self
    }

    /// Replay the script until closed, sleeping `pace` between packets.
    pub fn endless(mut self, pace: Duration) -> Self {
        self.replay = Replay::Endless { pace };
        self
    }

    /// Shared health counters of this source.
    pub fn health(&self) -> SourceHealth {
        self.health.clone()
    }

    fn spawn_listener(&self, index: usize, tx: UnboundedSender<Packet>) -> std::io::Result<ListenerHandle> {
        let replay = self.replay;
        let health = self.health.clone();

        ListenerHandle::spawn(format!("mock-{index}"), move |running| {
            let packets = script();
            loop {
                for packet in &packets {
                    if !running.load(Ordering::SeqCst) {
                        return;
                    }
                    if tx.send(packet.clone()).is_err() {
                        debug!("Mock listener {index}: stream closed");
                        return;
                    }
                    health.record_published();
                    if let Replay::Endless { pace } = replay {
                        std::thread::sleep(pace);
                    }
                }
                if let Replay::Once = replay {
                    debug!("Mock listener {index}: script complete");
                    return;
                }
            }
        })
    }
}

impl Default for MockPacketFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketFetcher for MockPacketFetcher {
    fn open(&mut self) -> Result<(), CaptureError> {
        if !self.available {
            return Err(CaptureError::SourceUnavailable(
                "synthetic source configured as unavailable".to_string(),
            ));
        }
        self.opened = true;
        Ok(())
    }

    fn fetch(&mut self) -> PacketStream {
        if !self.opened || self.fetched {
            warn!("Mock source fetched while not open or fetched twice; returning an ended stream");
            return exhausted_stream();
        }
        self.fetched = true;

        let (tx, rx) = mpsc::unbounded_channel();
        for index in 0..self.listeners {
            match self.spawn_listener(index, tx.clone()) {
                Ok(handle) => self.running.push(handle),
                Err(e) => {
                    self.health.record_registration_failure();
                    warn!("Mock listener {index} could not start: {e}");
                }
            }
        }
        info!("Mock source started {} listener(s)", self.running.len());
        rx
    }

    fn close(&mut self) {
        stop_all(std::mem::take(&mut self.running));
        self.opened = false;
    }
}
