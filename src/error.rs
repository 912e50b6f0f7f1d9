//! Error types for the capture pipeline.

use thiserror::Error;

use crate::engine::EngineState;

/// Errors raised by packet sources and the capture engine.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Packet source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Event carries no {0} address")]
    MissingAddress(&'static str),

    #[error("Frame of {0} bytes exceeds the 65535 byte packet length limit")]
    OversizedFrame(u64),

    #[error("Listener '{listener}' could not register: {reason}")]
    ListenerRegistrationFailed { listener: String, reason: String },

    #[error("Flush delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Capture engine task failed: {0}")]
    EngineTask(String),

    #[error("Invalid engine state: expected {expected}, found {actual}")]
    InvalidState {
        expected: EngineState,
        actual: EngineState,
    },
}

/// Errors raised by downstream flow writers.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Writer unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid value for '{key}': {value}")]
    InvalidValue { key: String, value: String },

    #[error("Config error: {0}")]
    Invalid(String),
}
