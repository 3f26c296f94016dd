//! ts-event-streamer
//!
//! Attaches to a PostgreSQL logical replication slot over `pgoutput`,
//! decodes WAL for TimescaleDB hypertables into canonical events, snapshots
//! existing chunks under the slot's exported snapshot, and dispatches
//! everything to a configurable sink.

mod backoff;
mod config;
mod connection;
mod dispatcher;
mod errors;
mod event;
mod lsn;
mod model;
mod offset;
mod pgtypes;
mod replication_connection;
mod replicator;
mod side_channel;
mod sink;
mod snapshotter;
mod state_storage;
mod tracing_context;
mod utils;
mod wal;

use crate::config::Config;
use crate::replicator::Replicator;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ts-event-streamer", about = "TimescaleDB hypertable change-data-capture streamer", version = "0.1.0")]
struct Args {
    /// Path to a TOML configuration file. Every setting it carries can be
    /// overridden by the matching environment variable.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log output format: "compact" (human-readable) or "json" (structured).
    /// Defaults to the LOG_FORMAT environment variable, then "compact".
    #[arg(long)]
    log_format: Option<String>,
}

fn init_tracing(format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match format {
        "json" => builder.json().init(),
        _ => builder.compact().init(),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let log_format = args.log_format.or_else(|| std::env::var("LOG_FORMAT").ok()).unwrap_or_else(|| "compact".to_string());
    init_tracing(&log_format);

    let exit_code = match Config::load(args.config.as_deref()) {
        Ok(config) => run(config).await,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            err.exit_code()
        }
    };

    std::process::exit(exit_code);
}

/// Runs the replicator to completion (or until a shutdown signal), returning
/// the process exit code it should report.
async fn run(config: Config) -> i32 {
    let replicator = std::sync::Arc::new(Replicator::new(config));
    let mut run_handle = {
        let replicator = replicator.clone();
        tokio::spawn(async move { replicator.run().await })
    };

    let result = tokio::select! {
        result = &mut run_handle => result.map_err(crate::errors::StreamerError::from).and_then(|r| r),
        _ = wait_for_shutdown_signal() => {
            info!("shutdown signal received, stopping gracefully");
            replicator.stop(run_handle).await
        }
    };

    match result {
        Ok(()) => {
            info!("replicator exited cleanly");
            0
        }
        Err(err) => {
            error!(error = %err, "replicator exited with an error");
            err.exit_code()
        }
    }
}

/// Resolves once SIGINT or SIGTERM arrives (SIGTERM is Unix-only; on other
/// platforms only Ctrl-C is honored).
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
