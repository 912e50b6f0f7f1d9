//! Lightprobe - network flow metadata collector
//!
//! Packet events from a pluggable source (kernel connection tracking or a
//! scripted generator) are aggregated into per-interface, per-flow
//! counters. A periodic flush snapshots and resets the table and hands the
//! snapshot to a writer on a separate delivery thread.

pub mod capture;
pub mod config;
pub mod controller;
pub mod domain;
pub mod engine;
pub mod error;
pub mod flow;
pub mod writer;

pub use capture::{ConntrackPacketFetcher, MockPacketFetcher, PacketFetcher, SourceHealth};
pub use config::{Config, OutputKind, SourceKind};
pub use controller::{Controller, RunSummary};
pub use domain::{Counters, Direction, FlowKey, Packet};
pub use engine::{CaptureEngine, EngineConfig, EngineHandle, EngineState, ShutdownTrigger};
pub use error::{CaptureError, ConfigError, WriteError};
pub use flow::{FlowSnapshot, FlowTable};
pub use writer::{ConsoleWriter, DeliveryWorker, FlowWriter, JsonLinesWriter};
