//! Delivery worker: drains the hand-off queue into a `FlowWriter`.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::mpsc::Receiver;
use tracing::{debug, error, info, warn};

use super::FlowWriter;
use crate::error::CaptureError;
use crate::flow::FlowSnapshot;

/// Retry behavior for failed writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    /// Tries per snapshot, including the first
    pub attempts: u32,
    /// Wait before retry `n` is `backoff * n`
    pub backoff: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Outcome counters of a delivery worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Snapshots written
    pub delivered: u64,
    /// Snapshots abandoned after exhausting all attempts
    pub dropped: u64,
}

/// A thread that writes every snapshot received on the hand-off queue.
///
/// The worker exits once every sender of the queue has been dropped and
/// the queue is empty.
pub struct DeliveryWorker {
    thread: JoinHandle<DeliveryReport>,
}

impl DeliveryWorker {
    pub fn spawn(
        queue: Receiver<FlowSnapshot>,
        writer: Box<dyn FlowWriter>,
        policy: DeliveryPolicy,
    ) -> io::Result<Self> {
        let thread = thread::Builder::new()
            .name("flow-delivery".to_string())
            .spawn(move || deliver_all(queue, writer, policy))?;
        Ok(Self { thread })
    }

    /// Block until the queue is drained.
    pub fn join(self) -> Result<DeliveryReport, CaptureError> {
        self.thread
            .join()
            .map_err(|_| CaptureError::DeliveryFailed("delivery worker panicked".to_string()))
    }
}

fn deliver_all(
    mut queue: Receiver<FlowSnapshot>,
    mut writer: Box<dyn FlowWriter>,
    policy: DeliveryPolicy,
) -> DeliveryReport {
    let mut report = DeliveryReport::default();
    debug!("Delivery worker started");

    while let Some(snapshot) = queue.blocking_recv() {
        if write_with_retry(writer.as_mut(), &snapshot, policy) {
            report.delivered += 1;
        } else {
            report.dropped += 1;
            error!(
                "Dropping snapshot with {} flow(s) after {} attempt(s)",
                snapshot.flow_count(),
                policy.attempts
            );
        }
    }

    writer.on_stop();
    info!(
        "Delivery worker finished: {} delivered, {} dropped",
        report.delivered, report.dropped
    );
    report
}

fn write_with_retry(writer: &mut dyn FlowWriter, snapshot: &FlowSnapshot, policy: DeliveryPolicy) -> bool {
    let attempts = policy.attempts.max(1);
    for attempt in 1..=attempts {
        match writer.write(snapshot) {
            Ok(()) => return true,
            Err(e) => {
                warn!("Write attempt {}/{} failed: {}", attempt, attempts, e);
                if attempt < attempts {
                    thread::sleep(policy.backoff * attempt);
                }
            }
        }
    }
    false
}
