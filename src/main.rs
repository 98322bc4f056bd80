//! CNAB ingestion pipeline: accepts fixed-width transaction files over
//! HTTP, durably tracks each upload through a resumable processing
//! pipeline, and recovers uploads that got stuck mid-flight.
//!
//! Both the HTTP listener and the background `ProcessingEngine` /
//! `RecoveryLoop` consumers run in the same process, coordinated through a
//! `tokio::sync::watch` shutdown signal (spec §5 graceful shutdown), the
//! same shape as the teacher's server-plus-background-task split.

use clap::Parser;
use std::error::Error;
use tracing::{error, info, warn};

mod app_state;
mod config;
mod domain;
mod error;
mod hasher;
mod ingestion_front;
mod lock;
mod logging;
mod parser;
mod processing_engine;
mod queue;
mod recovery_loop;
mod server;
mod storage;

use app_state::PipelineState;
use logging::init_logging;
use processing_engine::ProcessingEngine;
use recovery_loop::RecoveryLoop;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (defaults to ./config.yaml if present).
    #[arg(long)]
    config: Option<String>,

    /// Override the data directory from the config file.
    #[arg(long)]
    data_dir: Option<String>,

    /// Override the listen port from the config file.
    #[arg(long)]
    port: Option<u16>,

    /// Run for a fixed number of seconds then exit (for testing).
    #[arg(long)]
    duration: Option<u64>,
}

fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| Box::<dyn Error + Send + Sync>::from(format!("failed to create runtime: {e}")))?;

    let result = runtime.block_on(async_main());
    runtime.shutdown_timeout(std::time::Duration::from_secs(2));
    result
}

async fn async_main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let args = Args::parse();
    init_logging();

    let mut config = config::load_config(args.config.map(std::path::PathBuf::from));
    if let Some(data_dir) = args.data_dir {
        config.storage.object_store_dir = format!("{data_dir}/blobs");
        config.storage.data_dir = data_dir;
    }
    if let Some(port) = args.port {
        config.backend.port = port;
    }

    let state = PipelineState::new_production(config).await?;
    info!("🚀 pipeline ready, data_dir={}", state.config.storage.data_dir);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let engine = ProcessingEngine::new(state.clone());
    let engine_rx = shutdown_rx.clone();
    let engine_handle = tokio::spawn(async move { engine.run("processing-engine-1", engine_rx).await });

    let recovery = RecoveryLoop::new(state.clone());
    let recovery_rx = shutdown_rx.clone();
    let recovery_handle = tokio::spawn(async move { recovery.run(recovery_rx).await });

    server::run_server_with_duration(state.clone(), args.duration).await?;

    if shutdown_tx.send(true).is_err() {
        warn!("shutdown signal had no receivers left");
    }
    if let Err(e) = engine_handle.await {
        error!("processing engine task panicked: {e}");
    }
    if let Err(e) = recovery_handle.await {
        error!("recovery loop task panicked: {e}");
    }

    state.cleanup_and_save().await;
    info!("🧹 ingestion pipeline shutdown complete");

    // sled keeps background IO threads alive past a clean shutdown; force
    // exit rather than hang waiting for them to join.
    std::process::exit(0)
}
