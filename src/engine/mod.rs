//! Capture engine.
//!
//! Owns one packet source and one flow table, and runs the single consumer
//! loop that applies packets, answers flush triggers and drains on shutdown.

mod capture_engine;
mod shutdown;
mod state;
mod stats;

pub use capture_engine::{CaptureEngine, EngineConfig, EngineHandle};
pub use shutdown::ShutdownTrigger;
pub use state::EngineState;
pub use stats::{EngineReport, EngineStats};
