//! Live connection-tracking packet source.
//!
//! Subscribes to the kernel's "new" and "update" conntrack event groups,
//! one listener per group, and turns each event into a `Packet`.

mod baseline;
mod netlink;
#[cfg(target_os = "linux")]
mod socket;

pub use baseline::ByteBaselines;
pub use netlink::{parse_datagram, ConntrackEvent};

use std::fmt;

use tracing::warn;

use super::listener::{stop_all, ListenerHandle, SourceHealth};
use super::{exhausted_stream, PacketFetcher, PacketStream};
use crate::domain::{Direction, Packet};
use crate::error::CaptureError;

/// Conntrack event classes a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    New,
    Update,
}

impl EventClass {
    /// Netlink multicast group bit (NF_NETLINK_CONNTRACK_*).
    pub fn group_mask(&self) -> u32 {
        match self {
            Self::New => 0x0000_0001,
            Self::Update => 0x0000_0002,
        }
    }

    pub fn all() -> [EventClass; 2] {
        [Self::New, Self::Update]
    }
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Update => write!(f, "update"),
        }
    }
}

/// Convert a decoded event into an inbound packet on `iface`.
///
/// The length is the growth of the connection's original direction byte
/// counter since its previous event, or 0 when accounting is off. Growth
/// beyond 65535 bytes is rejected as `OversizedFrame`.
pub fn event_to_packet(
    event: &ConntrackEvent,
    iface: &str,
    baselines: &ByteBaselines,
) -> Result<Packet, CaptureError> {
    let length = match event.orig_bytes {
        Some(total) => baselines.delta(event.key, total),
        None => 0,
    };
    Packet::from_frame(event.key, iface, length, Direction::Inbound)
}

/// Packet source backed by kernel connection tracking.
pub struct ConntrackPacketFetcher {
    iface: String,
    classes: Vec<EventClass>,
    #[cfg(target_os = "linux")]
    sockets: Vec<(EventClass, socket::ConntrackSocket)>,
    running: Vec<ListenerHandle>,
    #[cfg(target_os = "linux")]
    baselines: ByteBaselines,
    health: SourceHealth,
    fetched: bool,
}

impl ConntrackPacketFetcher {
    /// Create a fetcher that stamps every event with `iface`.
    pub fn new(iface: impl Into<String>) -> Self {
        Self {
            iface: iface.into(),
            classes: EventClass::all().to_vec(),
            #[cfg(target_os = "linux")]
            sockets: Vec::new(),
            running: Vec::new(),
            #[cfg(target_os = "linux")]
            baselines: ByteBaselines::new(),
            health: SourceHealth::new(),
            fetched: false,
        }
    }

    /// Restrict the subscribed event classes.
    pub fn with_classes(mut self, classes: &[EventClass]) -> Self {
        self.classes = classes.to_vec();
        self
    }

    /// Shared health counters of this source.
    pub fn health(&self) -> SourceHealth {
        self.health.clone()
    }
}

#[cfg(target_os = "linux")]
mod live {
    use std::sync::atomic::Ordering;

    use tokio::sync::mpsc::{self, UnboundedSender};
    use tracing::{debug, error, info, warn};

    use super::socket::{is_overrun, is_timeout, ConntrackSocket};
    use super::*;

    /// Largest datagram the kernel sends for a conntrack event batch
    const RECV_BUF_LEN: usize = 64 * 1024;

    pub(super) fn open(fetcher: &mut ConntrackPacketFetcher) -> Result<(), CaptureError> {
        let mut sockets = Vec::with_capacity(fetcher.classes.len());
        for class in &fetcher.classes {
            let socket = ConntrackSocket::new().map_err(|e| {
                CaptureError::SourceUnavailable(format!("cannot open netfilter netlink socket: {e}"))
            })?;
            sockets.push((*class, socket));
        }
        fetcher.sockets = sockets;
        info!(
            "Opened conntrack source with {} socket(s) for interface {}",
            fetcher.sockets.len(),
            fetcher.iface
        );
        Ok(())
    }

    pub(super) fn fetch(fetcher: &mut ConntrackPacketFetcher) -> PacketStream {
        let (tx, rx) = mpsc::unbounded_channel();
        for (class, socket) in std::mem::take(&mut fetcher.sockets) {
            let iface = fetcher.iface.clone();
            let baselines = fetcher.baselines.clone();
            let health = fetcher.health.clone();
            let tx = tx.clone();
            let spawned = ListenerHandle::spawn(format!("conntrack-{class}"), move |running| {
                let sink = EventSink {
                    iface: &iface,
                    baselines: &baselines,
                    health: &health,
                    tx: &tx,
                };
                listen(class, socket, &sink, &running)
            });
            match spawned {
                Ok(handle) => fetcher.running.push(handle),
                Err(e) => {
                    fetcher.health.record_registration_failure();
                    error!("{}", registration_error(class, e.to_string()));
                }
            }
        }
        rx
    }

    pub(super) fn release(fetcher: &mut ConntrackPacketFetcher) {
        fetcher.sockets.clear();
    }

    fn registration_error(class: EventClass, reason: String) -> CaptureError {
        CaptureError::ListenerRegistrationFailed {
            listener: class.to_string(),
            reason,
        }
    }

    /// Where a listener's decoded events go.
    struct EventSink<'a> {
        iface: &'a str,
        baselines: &'a ByteBaselines,
        health: &'a SourceHealth,
        tx: &'a UnboundedSender<Packet>,
    }

    fn listen(
        class: EventClass,
        socket: ConntrackSocket,
        sink: &EventSink<'_>,
        running: &std::sync::atomic::AtomicBool,
    ) {
        let health = sink.health;
        if let Err(e) = socket.subscribe(class.group_mask()) {
            health.record_registration_failure();
            error!("{}", registration_error(class, e.to_string()));
            return;
        }
        info!("Conntrack listener [{}] registered", class);

        let mut buf = vec![0u8; RECV_BUF_LEN];
        while running.load(Ordering::SeqCst) {
            let len = match socket.recv(&mut buf) {
                Ok(len) => len,
                Err(ref e) if is_timeout(e) => continue,
                Err(ref e) if is_overrun(e) => {
                    warn!("Conntrack listener [{}]: receive buffer overrun, events lost", class);
                    continue;
                }
                Err(e) => {
                    health.record_transport_failure();
                    error!("Conntrack listener [{}]: transport lost: {}", class, e);
                    return;
                }
            };

            for result in parse_datagram(&buf[..len]) {
                match result.and_then(|event| event_to_packet(&event, sink.iface, sink.baselines)) {
                    Ok(packet) => {
                        if sink.tx.send(packet).is_err() {
                            debug!("Conntrack listener [{}]: stream closed", class);
                            return;
                        }
                        health.record_published();
                    }
                    Err(e @ CaptureError::OversizedFrame(_)) => {
                        health.record_oversized();
                        debug!("Conntrack listener [{}]: dropped event: {}", class, e);
                    }
                    Err(e) => {
                        health.record_malformed();
                        debug!("Conntrack listener [{}]: dropped event: {}", class, e);
                    }
                }
            }
        }
        info!("Conntrack listener [{}]: closing down", class);
    }
}

#[cfg(not(target_os = "linux"))]
mod live {
    use super::*;

    pub(super) fn open(_fetcher: &mut ConntrackPacketFetcher) -> Result<(), CaptureError> {
        Err(CaptureError::SourceUnavailable(
            "conntrack packet fetching is only available on linux".to_string(),
        ))
    }

    pub(super) fn fetch(_fetcher: &mut ConntrackPacketFetcher) -> PacketStream {
        exhausted_stream()
    }

    pub(super) fn release(_fetcher: &mut ConntrackPacketFetcher) {}
}

impl PacketFetcher for ConntrackPacketFetcher {
    fn open(&mut self) -> Result<(), CaptureError> {
        live::open(self)
    }

    fn fetch(&mut self) -> PacketStream {
        if self.fetched {
            warn!("Conntrack source fetched twice; returning an ended stream");
            return exhausted_stream();
        }
        self.fetched = true;
        live::fetch(self)
    }

    fn close(&mut self) {
        stop_all(std::mem::take(&mut self.running));
        live::release(self);
    }
}
