use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use lightprobe::{CaptureError, Config, Controller};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lightprobe")]
#[command(about = "Collects per-flow byte and packet counters and flushes them periodically")]
struct Args {
    /// Config file (default: $LIGHTPROBE_CONFIG or /etc/lightprobe.conf)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Packet source: conntrack or mock
    #[arg(short, long)]
    source: Option<String>,

    /// Interface label stamped on connection tracking events
    #[arg(short, long)]
    interface: Option<String>,

    /// Seconds between flushes
    #[arg(short, long)]
    flush_interval: Option<u64>,

    /// Output: console or jsonl:<path>
    #[arg(short, long)]
    output: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => Config::load().context("Failed to load configuration")?,
    };

    // Command-line flags override file and environment
    if let Some(source) = &args.source {
        config.set("source", source)?;
    }
    if let Some(interface) = &args.interface {
        config.set("interface", interface)?;
    }
    if let Some(secs) = args.flush_interval {
        config.set("flush_interval", &secs.to_string())?;
    }
    if let Some(output) = &args.output {
        config.set("output", output)?;
    }
    Ok(config)
}

fn init_logging(config: &Config, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("lightprobe=debug")
        } else {
            EnvFilter::new(&config.log_filter)
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(config: Config) -> Result<ExitCode> {
    let controller = Controller::new(config).context("Invalid configuration")?;

    // SIGINT and SIGTERM both fire the shutdown trigger
    let trigger = controller.shutdown_trigger();
    ctrlc::set_handler(move || {
        if !trigger.fire() {
            tracing::debug!("Shutdown already in progress");
        }
    })
    .context("Failed to set signal handler")?;

    match controller.run().await {
        Ok(summary) => {
            if summary.source.registration_failures > 0 {
                tracing::warn!("Some listeners never registered");
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e @ CaptureError::SourceUnavailable(_)) => {
            tracing::error!("{}", e);
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e).context("Collector failed"),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&config, args.verbose);

    tracing::info!("Starting lightprobe");
    tracing::debug!("Configuration: {:?}", config);

    run(config).await
}
