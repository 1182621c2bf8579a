//! Command-line entry point shared by the shipped `dispatchq-worker` binary
//! and application-built worker binaries that embed their own registry.

use crate::config::QueueConfig;
use crate::registry::JobRegistry;
use crate::storage::DriverConfig;
use crate::supervisor::WorkerSupervisor;
use crate::worker::Worker;
use crate::{schema, storage};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "dispatchq-worker")]
#[command(about = "Drains the dispatchq job queue for this host")]
struct WorkerArgs {
    /// Serialized driver configuration, as produced by the dispatcher.
    #[arg(long = "driver-config", value_name = "JSON")]
    driver_config: String,

    /// Serialized queue configuration.
    #[arg(long = "config", value_name = "JSON")]
    config: String,
}

/// Parse `--driver-config`/`--config` from the process arguments, acquire
/// the worker lock, and drain the queue with the given registry.
///
/// Returns exit code 0 on a clean shutdown (signal or worker lifetime
/// reached) and 1 on initialization failure: unparseable configuration,
/// unreachable storage, or lock contention.
pub async fn run_worker_from_args(registry: JobRegistry) -> ExitCode {
    let args = match WorkerArgs::try_parse() {
        Ok(args) => args,
        Err(error) => {
            let _ = error.print();
            return ExitCode::from(1);
        }
    };

    let driver_config: DriverConfig = match serde_json::from_str(&args.driver_config) {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "Invalid --driver-config JSON");
            return ExitCode::from(1);
        }
    };
    let config: QueueConfig = match serde_json::from_str(&args.config) {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "Invalid --config JSON");
            return ExitCode::from(1);
        }
    };
    config.effective_workers();

    let storage = match storage::connect(&driver_config).await {
        Ok(storage) => storage,
        Err(error) => {
            error!(%error, "Storage is unreachable");
            return ExitCode::from(1);
        }
    };
    if let Err(error) = schema::ensure_tables(storage.as_ref()).await {
        error!(%error, "Failed to provision queue tables");
        return ExitCode::from(1);
    }

    let supervisor = WorkerSupervisor::new(config.clone());
    if let Err(error) = supervisor.acquire_lock() {
        error!(%error, "Another worker owns the lock");
        return ExitCode::from(1);
    }

    info!(pid = std::process::id(), "Queue worker started");
    let worker = Worker::new(storage, Arc::new(registry), config);
    worker.install_signal_handler();
    worker.run().await;

    supervisor.release_lock();
    info!("Queue worker stopped");
    ExitCode::SUCCESS
}
