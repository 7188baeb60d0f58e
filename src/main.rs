//! handler-sim: A test-handler equipment-interface simulator
//!
//! Lets host test software run against a simulated handler:
//! - Hands out simulated DUTs from a pre-generated lot, one per site
//! - Tracks per-site temperature setpoints
//! - Records submitted bin results and writes a lot summary CSV
//! - Configuration via TOML file with CLI overrides

mod config;
mod deploy;
mod dispatch;
mod dut;
mod protocol;
mod server;
mod storage;
mod summary;

use clap::Parser;
use config::{CliArgs, Config};
use dispatch::Dispatcher;
use dut::DutPool;
use server::{Server, ShutdownSignal};
use std::sync::Arc;
use summary::SummaryWriter;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    info!(
        listen = %config.listen_addr(),
        lot_id = %config.lot_id,
        units = config.units,
        allowed_peers = config.allow_list.len(),
        summary_dir = %config.summary_dir.display(),
        "Starting handler simulator"
    );

    if let Some(deploy) = &config.deploy {
        deploy::spawn(deploy.clone(), config.work_dir.clone());
    }

    let pool = DutPool::generate(&config.lot_id, config.units, &mut rand::thread_rng());
    let writer = SummaryWriter::new(&config.summary_dir, &config.lot_id, chrono::Local::now());
    let dispatcher = Arc::new(Dispatcher::new(pool, writer, &config.lot_id));

    let listener = match Server::bind(config.listen_addr()) {
        Ok(listener) => listener,
        Err(e) => {
            error!(listen = %config.listen_addr(), error = %e, "Failed to bind");
            std::process::exit(1);
        }
    };

    let mut signals = match ShutdownSignal::new() {
        Ok(signals) => signals,
        Err(e) => {
            error!(error = %e, "Failed to install signal handlers");
            std::process::exit(1);
        }
    };

    let server = Server::new(&config.allow_list, Arc::clone(&dispatcher));
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match signals.recv().await {
            Ok(signal) => {
                info!(signal, "Shutdown requested");
                shutdown.trigger();
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    server.serve(listener).await?;

    info!(duts_held = dispatcher.duts_held(), "Server stopped");
    Ok(())
}
