use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::engine::EngineConfig;
use crate::error::ConfigError;
use crate::writer::DeliveryPolicy;

const DEFAULT_CONFIG_PATH: &str = "/etc/lightprobe.conf";
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 300;
const DEFAULT_INTERFACE: &str = "any";
const DEFAULT_DELIVERY_QUEUE: usize = 4;
const DEFAULT_WRITE_ATTEMPTS: u32 = 3;
const DEFAULT_FINAL_DELIVERY_TIMEOUT_SECS: u64 = 5;
const DEFAULT_LOG_FILTER: &str = "lightprobe=info";

/// Where packets come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceKind {
    /// Kernel connection tracking events
    #[default]
    Conntrack,
    /// Scripted synthetic packets
    Mock,
}

impl FromStr for SourceKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "conntrack" => Ok(SourceKind::Conntrack),
            "mock" => Ok(SourceKind::Mock),
            _ => Err(invalid("source", s)),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Conntrack => write!(f, "conntrack"),
            SourceKind::Mock => write!(f, "mock"),
        }
    }
}

/// Where snapshots go.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputKind {
    #[default]
    Console,
    /// Append JSON lines to a file
    JsonLines(PathBuf),
}

impl FromStr for OutputKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("console") {
            return Ok(OutputKind::Console);
        }
        match s.split_once(':') {
            Some(("jsonl", path)) if !path.trim().is_empty() => {
                Ok(OutputKind::JsonLines(PathBuf::from(path.trim())))
            }
            _ => Err(invalid("output", s)),
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputKind::Console => write!(f, "console"),
            OutputKind::JsonLines(path) => write!(f, "jsonl:{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub flush_interval: Duration,
    pub source: SourceKind,
    /// Interface label stamped on live events
    pub interface: String,
    pub output: OutputKind,
    /// Capacity of the snapshot hand-off queue
    pub delivery_queue: usize,
    pub write_attempts: u32,
    pub final_delivery_timeout: Duration,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
            source: SourceKind::default(),
            interface: DEFAULT_INTERFACE.to_string(),
            output: OutputKind::default(),
            delivery_queue: DEFAULT_DELIVERY_QUEUE,
            write_attempts: DEFAULT_WRITE_ATTEMPTS,
            final_delivery_timeout: Duration::from_secs(DEFAULT_FINAL_DELIVERY_TIMEOUT_SECS),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl Config {
    /// Load from the config file named by `LIGHTPROBE_CONFIG` (or the
    /// default path), then apply `LIGHTPROBE_*` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("LIGHTPROBE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(config_path)
    }

    /// Like `load`, but from an explicit config file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Read a `key = value` file. A missing file yields the defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse `key = value` lines on top of the defaults.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                config.set(key.trim(), value.trim())?;
            }
        }
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        for key in [
            "flush_interval",
            "source",
            "interface",
            "output",
            "delivery_queue",
            "write_attempts",
            "final_delivery_timeout",
            "log_filter",
        ] {
            let var = format!("LIGHTPROBE_{}", key.to_ascii_uppercase());
            if let Ok(val) = std::env::var(&var) {
                self.set(key, &val)?;
            }
        }
        Ok(())
    }

    /// Set one field from its textual form. Unknown keys are ignored.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "flush_interval" => self.flush_interval = Duration::from_secs(parse_num(key, value)?),
            "source" => self.source = value.parse()?,
            "interface" => self.interface = value.to_string(),
            "output" => self.output = value.parse()?,
            "delivery_queue" => self.delivery_queue = parse_num(key, value)?,
            "write_attempts" => self.write_attempts = parse_num(key, value)?,
            "final_delivery_timeout" => {
                self.final_delivery_timeout = Duration::from_secs(parse_num(key, value)?)
            }
            "log_filter" => self.log_filter = value.to_string(),
            _ => {}
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "flush_interval must be greater than zero".to_string(),
            ));
        }
        if self.delivery_queue == 0 {
            return Err(ConfigError::Invalid(
                "delivery_queue must be greater than zero".to_string(),
            ));
        }
        if self.write_attempts == 0 {
            return Err(ConfigError::Invalid(
                "write_attempts must be greater than zero".to_string(),
            ));
        }
        if self.interface.is_empty() {
            return Err(ConfigError::Invalid("interface must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            final_delivery_timeout: self.final_delivery_timeout,
        }
    }

    pub fn delivery_policy(&self) -> DeliveryPolicy {
        DeliveryPolicy {
            attempts: self.write_attempts,
            ..DeliveryPolicy::default()
        }
    }
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}
