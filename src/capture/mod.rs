//! Packet source abstraction.
//!
//! This module defines the `PacketFetcher` trait and provides a synthetic
//! generator for tests plus a live connection-tracking source. The capture
//! engine depends only on the trait, so sources can be swapped freely.

mod conntrack;
mod listener;
mod mock_fetcher;

pub use conntrack::{ConntrackPacketFetcher, EventClass};
pub use listener::{ListenerHandle, SourceHealth, SourceHealthReport};
pub use mock_fetcher::{script, MockPacketFetcher};

use tokio::sync::mpsc::UnboundedReceiver;

use crate::domain::Packet;
use crate::error::CaptureError;

/// Unbounded, non-restartable stream of packets from one source.
pub type PacketStream = UnboundedReceiver<Packet>;

/// A source of packet events.
///
/// Lifecycle: `open`, then `fetch` once, then `close`.
pub trait PacketFetcher: Send + 'static {
    /// Establish the connection to the underlying event source.
    ///
    /// Fails with `CaptureError::SourceUnavailable` if the transport cannot
    /// be established.
    fn open(&mut self) -> Result<(), CaptureError>;

    /// Start the listeners and return the shared output stream.
    ///
    /// Must not block. A second call returns a stream that is already
    /// exhausted.
    fn fetch(&mut self) -> PacketStream;

    /// Stop every listener.
    ///
    /// Returns only after all listeners have stopped publishing; the stream
    /// yields no new packets afterwards and ends once drained.
    fn close(&mut self);
}

impl<F: PacketFetcher + ?Sized> PacketFetcher for Box<F> {
    fn open(&mut self) -> Result<(), CaptureError> {
        (**self).open()
    }

    fn fetch(&mut self) -> PacketStream {
        (**self).fetch()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// A stream that has already ended.
pub(crate) fn exhausted_stream() -> PacketStream {
    let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
    rx
}
