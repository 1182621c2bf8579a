#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod callable;
mod config;
mod dispatcher;
mod errors;
mod job;
mod manager;
mod registry;
mod retry;
/// Table definitions and provisioning.
pub mod schema;
/// Abstract storage port and the sqlx-backed drivers.
pub mod storage;
mod supervisor;
mod worker;
mod worker_cli;

/// Callable descriptors and their wire codec.
pub use self::callable::{Callable, CallableCodec, EncodedCallable};
/// Shared queue/worker configuration.
pub use self::config::{QueueConfig, LOCK_FILE_NAME};
/// The producer surface.
pub use self::dispatcher::{Dispatcher, JobHandle};
/// Crate error kinds.
pub use self::errors::{Error, Result, StorageError};
/// Row types and enums.
pub use self::job::{CallableKind, FailedJob, Job, JobPriority, JobStats, JobStatus};
/// Administrative operations.
pub use self::manager::JobManager;
/// Handler registry.
pub use self::registry::{Handler, Invocation, JobRegistry};
/// Retry policy.
pub use self::retry::{decide as retry_decision, RetryDecision};
/// Storage driver selection and the neutral row model.
pub use self::storage::{connect, DriverConfig, DriverKind, SqlRow, SqlValue, StorageBackend};
/// Lock-file management and worker spawning.
pub use self::supervisor::WorkerSupervisor;
/// The execution loop.
pub use self::worker::Worker;
/// Entry point for application-built worker binaries.
pub use self::worker_cli::run_worker_from_args;
