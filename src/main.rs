//! `daq-buffer`: runs the acquisition buffer server.
//!
//! ```bash
//! daq-buffer --port 1972 --samples 61440 --events 3600
//! daq-buffer --save-path /data/session01 --verbosity 1
//! daq-buffer --config buffer.toml --log-level debug
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use daq_buffer::{
    build_store, logging, BufferConfig, BufferServer, ConfigOverrides, ShutdownSignal, StoreGuard,
};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "daq-buffer", version)]
#[command(about = "Real-time acquisition buffer server", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Samples kept in memory
    #[arg(long)]
    samples: Option<u64>,

    /// Events kept in memory
    #[arg(long)]
    events: Option<usize>,

    /// Mirror all data to segment files in this directory
    #[arg(long)]
    save_path: Option<PathBuf>,

    /// Never evict; keep everything in memory
    #[arg(long)]
    unbounded: bool,

    /// Monitor verbosity (0-2)
    #[arg(long)]
    verbosity: Option<u8>,

    /// trace, debug, info, warn or error
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            port: self.port,
            sample_capacity: self.samples,
            event_capacity: self.events,
            save_path: self.save_path.clone(),
            unbounded: self.unbounded.then_some(true),
            monitor_verbosity: self.verbosity,
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = BufferConfig::load(cli.config.as_deref(), &cli.overrides())
        .context("failed to load configuration")?;
    logging::init_from_config(&config).context("failed to initialize logging")?;

    let guard = StoreGuard::new(build_store(&config.store_kind()).context("failed to create store")?);
    let server = BufferServer::from_config(&config, guard.store())?;
    let addr = server
        .bind()
        .await
        .with_context(|| format!("failed to bind {}:{}", config.bind_address, config.port))?;
    info!(%addr, kind = guard.store().kind(), "daq-buffer ready; press Ctrl+C or send SIGTERM to stop");

    let mut signals = ShutdownSignal::install().context("failed to install signal handlers")?;
    let stopper = server.clone();
    tokio::spawn(async move {
        let signal = signals.recv().await;
        info!(signal, "shutdown requested");
        stopper.stop().await;
    });

    server.run().await?;
    drop(guard);
    info!("daq-buffer exited");
    Ok(())
}
