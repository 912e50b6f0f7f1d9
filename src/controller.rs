//! Wires configuration, packet source, engine and delivery together.

use std::fmt;
use std::time::SystemTime;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::capture::{
    ConntrackPacketFetcher, MockPacketFetcher, PacketFetcher, SourceHealth, SourceHealthReport,
};
use crate::config::{Config, OutputKind, SourceKind};
use crate::engine::{CaptureEngine, EngineReport, ShutdownTrigger};
use crate::error::{CaptureError, ConfigError};
use crate::writer::{ConsoleWriter, DeliveryReport, DeliveryWorker, FlowWriter, JsonLinesWriter};

/// Totals of one collector run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub engine: EngineReport,
    pub delivery: DeliveryReport,
    pub source: SourceHealthReport,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "packets={}; flushes delivered={} dropped={}; final={}; written={} write-dropped={}; \
             source published={} malformed={} oversized={} registration-failures={} \
             transport-failures={}",
            self.engine.packets_applied,
            self.engine.flushes_delivered,
            self.engine.flushes_dropped,
            if self.engine.final_delivered { "delivered" } else { "dropped" },
            self.delivery.delivered,
            self.delivery.dropped,
            self.source.published,
            self.source.malformed,
            self.source.oversized,
            self.source.registration_failures,
            self.source.transport_failures,
        )
    }
}

/// Runs one collector from open to final delivery.
pub struct Controller {
    config: Config,
    source: Option<(Box<dyn PacketFetcher>, SourceHealth)>,
    writer: Option<Box<dyn FlowWriter>>,
    shutdown: ShutdownTrigger,
}

impl Controller {
    /// Fails if `config` does not pass `Config::validate`.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            source: None,
            writer: None,
            shutdown: ShutdownTrigger::new(),
        })
    }

    /// Use this source instead of the one named in the config.
    pub fn with_source(mut self, fetcher: Box<dyn PacketFetcher>, health: SourceHealth) -> Self {
        self.source = Some((fetcher, health));
        self
    }

    /// Use this writer instead of the one named in the config.
    pub fn with_writer(mut self, writer: Box<dyn FlowWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Trigger that ends the run. Safe to fire from a signal handler.
    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.shutdown.clone()
    }

    /// Open the source, collect until shutdown, and wait for delivery.
    ///
    /// Fails before any processing if the source cannot be opened or the
    /// output cannot be created.
    pub async fn run(mut self) -> Result<RunSummary, CaptureError> {
        let (fetcher, health) = match self.source.take() {
            Some(source) => source,
            None => build_source(&self.config),
        };

        let mut engine = CaptureEngine::new(fetcher, self.config.engine_config())
            .with_shutdown(self.shutdown.clone());
        engine.open()?;

        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => build_writer(&self.config.output)?,
        };

        let (delivery_tx, delivery_rx) = mpsc::channel(self.config.delivery_queue);
        let worker = DeliveryWorker::spawn(delivery_rx, writer, self.config.delivery_policy())
            .map_err(|e| CaptureError::DeliveryFailed(format!("cannot start delivery worker: {}", e)))?;

        let (flush_tx, flush_rx) = mpsc::channel(1);
        let handle = engine.run(flush_rx, delivery_tx)?;
        info!(
            "Collecting from {} source, flushing every {:?} to {}",
            self.config.source, self.config.flush_interval, self.config.output
        );

        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = ticker.tick() => {
                    if flush_tx.try_send(SystemTime::now()).is_err() {
                        debug!("Previous flush still pending; skipping tick");
                    }
                }
            }
        }
        drop(flush_tx);

        info!("Shutdown requested");
        let engine = handle.join().await?;
        let delivery = tokio::task::spawn_blocking(move || worker.join())
            .await
            .map_err(|e| CaptureError::DeliveryFailed(e.to_string()))??;

        let source = health.report();
        if health.is_degraded() {
            warn!("Packet source ran degraded: {:?}", source);
        }

        let summary = RunSummary {
            engine,
            delivery,
            source,
        };
        info!("Run summary: {}", summary);
        Ok(summary)
    }
}

fn build_source(config: &Config) -> (Box<dyn PacketFetcher>, SourceHealth) {
    match config.source {
        SourceKind::Conntrack => {
            let fetcher = ConntrackPacketFetcher::new(config.interface.clone());
            let health = fetcher.health();
            (Box::new(fetcher), health)
        }
        SourceKind::Mock => {
            let fetcher = MockPacketFetcher::new();
            let health = fetcher.health();
            (Box::new(fetcher), health)
        }
    }
}

fn build_writer(output: &OutputKind) -> Result<Box<dyn FlowWriter>, CaptureError> {
    match output {
        OutputKind::Console => Ok(Box::new(ConsoleWriter::new())),
        OutputKind::JsonLines(path) => JsonLinesWriter::open(path)
            .map(|writer| Box::new(writer) as Box<dyn FlowWriter>)
            .map_err(|e| {
                CaptureError::DeliveryFailed(format!("cannot open {}: {}", path.display(), e))
            }),
    }
}
