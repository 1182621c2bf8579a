//! The reference worker binary.
//!
//! Ships with an empty handler registry: it drains maintenance work and
//! surfaces unresolvable jobs through the normal retry/failure path.
//! Applications with registered handlers build their own thin binary around
//! [`dispatchq::run_worker_from_args`] and point `QueueConfig::worker_binary`
//! at it.

use dispatchq::{run_worker_from_args, JobRegistry};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    run_worker_from_args(JobRegistry::new()).await
}
