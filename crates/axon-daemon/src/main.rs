//! Axon Daemon - Main entry point
//!
//! Runs the property bus with the imager agent, the hotplug manager
//! and the simulated devices.

mod config;
mod monitor;
mod state;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "axon")]
#[command(about = "Device control bus with imager agent and simulated hardware")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "axon.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Write a default configuration file and exit
    #[arg(long)]
    init: bool,

    /// Attach every device, print the device names and exit
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Axon v{}", env!("CARGO_PKG_VERSION"));

    if args.init {
        config::save_default_config(&args.config)?;
        println!("Wrote {}", args.config.display());
        return Ok(());
    }

    let config = config::load_config(&args.config)?;
    info!(
        agent = %config.agent.name,
        cameras = config.hotplug.cameras.len(),
        focusers = config.simulator.focuser.instances,
        "Configuration loaded"
    );

    let state = state::AppState::new(config).await?;

    if args.list {
        let mut names = state.bus.device_names();
        names.sort();
        println!("Attached {} devices:", names.len());
        for name in names {
            println!("  - {}", name);
        }
        state.shutdown().await;
        return Ok(());
    }

    tokio::select! {
        _ = state.run() => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupt received, shutting down");
        }
    }
    state.shutdown().await;

    Ok(())
}
