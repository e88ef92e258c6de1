//! CLI entry point (SPEC_FULL.md §1 "Ambient stack").
//!
//! Grounded in the teacher's `main.rs::main`, which checks for a `--worker`
//! flag before any Tauri/runtime setup because "the worker creates its own
//! runtimes internally, so it must not run inside an existing tokio
//! runtime." This binary keeps that split literally: worker mode never
//! touches tokio at all (the command loop is plain `std::thread`/
//! `std::sync::mpsc`, see `worker::runtime`), so argument parsing and mode
//! dispatch happen before a `tokio::runtime::Runtime` is ever built.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, LevelFilter};

#[cfg(not(feature = "mock"))]
use llama_gateway_core::engine::RealLlamaEngine;
#[cfg(feature = "mock")]
use llama_gateway_core::engine::MockLlamaEngine;
use llama_gateway_core::worker::runtime;
use llama_gateway_core::{GatewayConfig, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "llama-gateway", about = "Single-slot model supervisor gateway")]
struct Cli {
    /// Run as a worker subprocess instead of the gateway (SPEC_FULL.md §4.2).
    #[arg(long)]
    worker: bool,

    /// Path to the JSON configuration file (SPEC_FULL.md §6).
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = llama_gateway_core::logging::init(LevelFilter::Info) {
        eprintln!("failed to set up logging: {e}");
    }

    if cli.worker {
        run_worker_mode();
        return;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run_gateway(cli.config)) {
        error!("gateway exited with error: {e}");
        std::process::exit(1);
    }
}

#[cfg(not(feature = "mock"))]
fn run_worker_mode() {
    let engine = match RealLlamaEngine::new() {
        Ok(engine) => engine,
        Err(e) => {
            error!("failed to initialize inference backend: {e}");
            std::process::exit(1);
        }
    };

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    runtime::run(engine, stdin.lock(), stdout.lock());
}

#[cfg(feature = "mock")]
fn run_worker_mode() {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    runtime::run(MockLlamaEngine::default(), stdin.lock(), stdout.lock());
}

async fn run_gateway(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = GatewayConfig::load(&config_path)?;
    let check_interval = Duration::from_secs(config.model_manager.check_interval);
    let idle_timeout = Duration::from_secs(config.model_manager.idle_timeout);

    let supervisor = Arc::new(Supervisor::new(config, config_path)?);
    let reaper = llama_gateway_core::reaper::spawn(Arc::clone(&supervisor), check_interval, idle_timeout);

    info!("gateway started, awaiting shutdown signal");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, unloading active model");

    reaper.abort();
    supervisor.unload_all_models().await;

    Ok(())
}
