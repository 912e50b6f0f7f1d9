//! Delivery of flow snapshots to downstream sinks.
//!
//! This module defines the `FlowWriter` trait and provides console and
//! JSON lines writers, plus the worker that feeds a writer from the
//! engine's hand-off queue so a slow sink never stalls ingestion.

mod console_writer;
mod delivery;
mod json_writer;

pub use console_writer::ConsoleWriter;
pub use delivery::{DeliveryPolicy, DeliveryReport, DeliveryWorker};
pub use json_writer::JsonLinesWriter;

use crate::error::WriteError;
use crate::flow::FlowSnapshot;

/// A sink for flow snapshots.
///
/// Implementations may block; they run on the delivery worker thread,
/// never on the capture engine's task.
pub trait FlowWriter: Send {
    /// Persist one snapshot.
    fn write(&mut self, snapshot: &FlowSnapshot) -> Result<(), WriteError>;

    /// Called once after the last snapshot.
    fn on_stop(&mut self) {}
}

impl<W: FlowWriter + ?Sized> FlowWriter for Box<W> {
    fn write(&mut self, snapshot: &FlowSnapshot) -> Result<(), WriteError> {
        (**self).write(snapshot)
    }

    fn on_stop(&mut self) {
        (**self).on_stop()
    }
}
