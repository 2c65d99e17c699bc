//! vasbridge - OpenVAS to IF-MAP and AMQP bridge
//!
//! This is the main entry point for the bridge binary.

mod bridge;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use tracing::{info, warn};
use vasbridge_common::logging::{init_logging_with_config, LogConfig};
use vasbridge_common::Config;

/// vasbridge
#[derive(Parser, Debug)]
#[command(name = "vasbridge")]
#[command(author = "Forge Cyber Defense")]
#[command(version)]
#[command(about = "Publishes OpenVAS scan results to IF-MAP and AMQP", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/vasbridge/vasbridge.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error); overrides config
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json, compact); overrides config
    #[arg(long)]
    log_format: Option<String>,

    /// Converter for the IF-MAP sink (overrides config)
    #[arg(long)]
    converter: Option<String>,

    /// Run a single poll cycle through all sinks and exit
    #[arg(long)]
    once: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

fn load_config(args: &Args) -> Result<(Config, bool)> {
    let found = Path::new(&args.config).exists();
    let config = if found {
        Config::from_file(&args.config).with_context(|| format!("loading {}", args.config))?
    } else {
        Config::default()
    };

    let mut config = config.merge_env();
    if let Some(converter) = &args.converter {
        config.ifmap.converter = converter.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = &args.log_format {
        config.logging.format = format.clone();
    }
    Ok((config, found))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (config, found) = load_config(&args)?;

    init_logging_with_config(LogConfig::from(&config.logging));

    info!("vasbridge starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    if !found {
        info!("Config file {} not found, using defaults", args.config);
    }

    config.validate().context("invalid configuration")?;
    bridge::check_converter(&config)?;

    if args.check_config {
        info!("Configuration is valid");
        return Ok(());
    }

    if config.nothing_to_do() {
        warn!("Publisher and subscriber are both disabled, nothing to do");
        return Ok(());
    }

    let failed = if args.once {
        bridge::run_once(&config).await?
    } else {
        bridge::run(&config).await?
    };

    if failed {
        anyhow::bail!("a worker failed, see log above");
    }
    info!("Shutdown complete");
    Ok(())
}
