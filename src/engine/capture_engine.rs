//! The capture engine and its consumer loop.

use std::time::{Duration, SystemTime};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{EngineReport, EngineState, EngineStats, ShutdownTrigger};
use crate::capture::PacketFetcher;
use crate::error::CaptureError;
use crate::flow::{FlowSnapshot, FlowTable};

/// Default wait for the final snapshot to be accepted by the delivery queue
const DEFAULT_FINAL_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long shutdown waits for the delivery queue to accept the final
    /// snapshot before dropping it.
    pub final_delivery_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            final_delivery_timeout: DEFAULT_FINAL_DELIVERY_TIMEOUT,
        }
    }
}

/// Aggregates packets from one source into one flow table.
///
/// Lifecycle: `open`, then `run`, then shut down through the returned
/// handle or a `ShutdownTrigger`.
pub struct CaptureEngine {
    fetcher: Box<dyn PacketFetcher>,
    config: EngineConfig,
    stats: EngineStats,
    shutdown: ShutdownTrigger,
}

impl CaptureEngine {
    /// Create an idle engine around a packet source.
    pub fn new(fetcher: Box<dyn PacketFetcher>, config: EngineConfig) -> Self {
        Self {
            fetcher,
            config,
            stats: EngineStats::new(),
            shutdown: ShutdownTrigger::new(),
        }
    }

    /// Stop on an externally owned trigger instead of a private one.
    pub fn with_shutdown(mut self, shutdown: ShutdownTrigger) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn state(&self) -> EngineState {
        self.stats.state()
    }

    /// Trigger that stops the engine once it runs; firing it earlier makes
    /// `run` drain immediately.
    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.shutdown.clone()
    }

    fn expect_state(&self, expected: EngineState) -> Result<(), CaptureError> {
        let actual = self.state();
        if actual != expected {
            return Err(CaptureError::InvalidState { expected, actual });
        }
        Ok(())
    }

    /// Open the packet source. On failure the engine stays `Idle`.
    pub fn open(&mut self) -> Result<(), CaptureError> {
        self.expect_state(EngineState::Idle)?;
        self.fetcher.open()?;
        self.stats.set_state(EngineState::Opened);
        info!("Capture engine opened");
        Ok(())
    }

    /// Start the consumer task and return immediately.
    ///
    /// Every value received on `flush` triggers a snapshot that is handed to
    /// `delivery` without waiting; the final snapshot on shutdown waits up
    /// to `final_delivery_timeout`. Must be called inside a tokio runtime.
    pub fn run(
        mut self,
        flush: Receiver<SystemTime>,
        delivery: Sender<FlowSnapshot>,
    ) -> Result<EngineHandle, CaptureError> {
        self.expect_state(EngineState::Opened)?;

        let packets = self.fetcher.fetch();
        self.stats.set_state(EngineState::Running);

        let stats = self.stats.clone();
        let shutdown = self.shutdown.clone();
        let consumer = Consumer {
            fetcher: self.fetcher,
            table: FlowTable::new(),
            stats: self.stats,
            shutdown: self.shutdown,
            final_delivery_timeout: self.config.final_delivery_timeout,
            delivery,
        };
        let task = tokio::spawn(consumer.run(packets, flush));

        Ok(EngineHandle {
            task,
            stats,
            shutdown,
        })
    }
}

/// Control handle of a running engine.
pub struct EngineHandle {
    task: JoinHandle<EngineReport>,
    stats: EngineStats,
    shutdown: ShutdownTrigger,
}

impl EngineHandle {
    pub fn state(&self) -> EngineState {
        self.stats.state()
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.shutdown.clone()
    }

    /// Request shutdown without waiting for it.
    pub fn shutdown(&self) {
        if !self.shutdown.fire() {
            debug!("Shutdown already requested");
        }
    }

    /// Wait for the consumer task to finish.
    pub async fn join(self) -> Result<EngineReport, CaptureError> {
        self.task
            .await
            .map_err(|e| CaptureError::EngineTask(e.to_string()))
    }

    /// Request shutdown and wait until the engine has stopped.
    pub async fn close(self) -> Result<EngineReport, CaptureError> {
        self.shutdown();
        self.join().await
    }
}

/// State moved into the consumer task.
struct Consumer {
    fetcher: Box<dyn PacketFetcher>,
    table: FlowTable,
    stats: EngineStats,
    shutdown: ShutdownTrigger,
    final_delivery_timeout: Duration,
    delivery: Sender<FlowSnapshot>,
}

impl Consumer {
    async fn run(
        self,
        mut packets: crate::capture::PacketStream,
        mut flush: Receiver<SystemTime>,
    ) -> EngineReport {
        let mut packets_open = true;
        let mut flush_open = true;
        info!("Capture engine running");

        while !self.shutdown.is_fired() {
            tokio::select! {
                biased;

                _ = self.shutdown.wait() => break,

                tick = flush.recv(), if flush_open => match tick {
                    Some(at) => self.flush(at),
                    None => {
                        debug!("Flush channel closed; periodic flushing disabled");
                        flush_open = false;
                    }
                },

                packet = packets.recv(), if packets_open => match packet {
                    Some(packet) => {
                        self.table.update(&packet);
                        self.stats.record_packet();
                    }
                    None => {
                        info!("Packet source exhausted; waiting for shutdown");
                        packets_open = false;
                    }
                },
            }
        }

        self.drain(packets).await
    }

    /// Snapshot, hand off without blocking, reset.
    fn flush(&self, at: SystemTime) {
        let snapshot = self.table.snapshot_and_reset(at, false);
        let flows = snapshot.flow_count();

        let outcome = match self.delivery.try_send(snapshot) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(CaptureError::DeliveryFailed(
                "delivery queue full".to_string(),
            )),
            Err(TrySendError::Closed(_)) => Err(CaptureError::DeliveryFailed(
                "delivery queue closed".to_string(),
            )),
        };

        match outcome {
            Ok(()) => {
                debug!("Flushed {} flow(s)", flows);
                self.stats.record_flush(true);
            }
            Err(e) => {
                warn!("{}; dropped interval with {} flow(s)", e, flows);
                self.stats.record_flush(false);
            }
        }
    }

    /// Stop consuming, close the source, deliver the final snapshot.
    async fn drain(self, packets: crate::capture::PacketStream) -> EngineReport {
        self.stats.set_state(EngineState::Draining);
        info!("Capture engine draining");

        let mut fetcher = self.fetcher;
        match tokio::task::spawn_blocking(move || {
            fetcher.close();
            fetcher
        })
        .await
        {
            Ok(fetcher) => drop(fetcher),
            Err(e) => error!("Closing the packet source failed: {}", e),
        }
        drop(packets);

        let snapshot = self.table.snapshot_and_reset(SystemTime::now(), true);
        let flows = snapshot.flow_count();
        let delivered = match tokio::time::timeout(
            self.final_delivery_timeout,
            self.delivery.send(snapshot),
        )
        .await
        {
            Ok(Ok(())) => {
                info!("Final snapshot with {} flow(s) handed off", flows);
                true
            }
            Ok(Err(_)) => {
                warn!("Final snapshot dropped: delivery queue closed");
                false
            }
            Err(_) => {
                warn!("Final snapshot dropped: delivery queue did not accept it in time");
                false
            }
        };
        self.stats.record_final(delivered);

        self.stats.set_state(EngineState::Stopped);
        let report = self.stats.report();
        info!(
            "Capture engine stopped: {} packet(s) applied, {} flush(es) delivered, {} dropped",
            report.packets_applied, report.flushes_delivered, report.flushes_dropped
        );
        report
    }
}
