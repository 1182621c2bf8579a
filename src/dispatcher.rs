//! Producer surface: a fluent builder that persists jobs and keeps a worker
//! alive to drain them.

use crate::callable::{Callable, CallableCodec};
use crate::config::QueueConfig;
use crate::errors::{Error, Result};
use crate::job::{Job, JobPriority, JobStats, JobStatus};
use crate::manager::{self, JobManager};
use crate::registry::{Invocation, JobRegistry};
use crate::schema::{self, JOBS_TABLE};
use crate::storage::{self, DriverConfig, SqlValue, StorageBackend};
use crate::supervisor::WorkerSupervisor;
use chrono::Utc;
use futures_util::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

const DEFAULT_MAX_RETRIES: i64 = 3;
const DEFAULT_TIMEOUT_SECS: i64 = 14_400;
const DEFAULT_RETRY_DELAY_SECS: i64 = 5;

/// Entry point for producers. Connects storage, provisions the tables, and
/// hands out [`JobHandle`] builders.
#[derive(Clone)]
pub struct Dispatcher {
    storage: Arc<dyn StorageBackend>,
    driver_config: DriverConfig,
    config: QueueConfig,
    codec: CallableCodec,
    registry: Arc<JobRegistry>,
    supervisor: WorkerSupervisor,
}

impl Dispatcher {
    /// Connect to storage and provision the queue tables.
    pub async fn new(
        driver_config: DriverConfig,
        config: QueueConfig,
        registry: JobRegistry,
    ) -> Result<Self> {
        let storage = storage::connect(&driver_config).await?;
        schema::ensure_tables(storage.as_ref()).await?;
        let codec = CallableCodec::new(config.secret());
        let supervisor = WorkerSupervisor::new(config.clone());
        Ok(Self {
            storage,
            driver_config,
            config,
            codec,
            registry: Arc::new(registry),
            supervisor,
        })
    }

    /// Begin describing a job for the given callable and parameters.
    pub fn job(&self, callable: Callable, params: Value) -> JobHandle<'_> {
        let name = callable.label();
        JobHandle {
            dispatcher: self,
            callable,
            params,
            name,
            priority: JobPriority::Normal,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: DEFAULT_TIMEOUT_SECS,
            retry_delay: DEFAULT_RETRY_DELAY_SECS,
            path_files: None,
        }
    }

    /// Look up a job by its dispatch uuid.
    pub async fn get_job_status(&self, uuid: &str) -> Result<Option<Job>> {
        manager::find_job_by_uuid(self.storage.as_ref(), uuid).await
    }

    /// Aggregate counts per status plus average completion latency.
    pub async fn get_job_stats(&self) -> Result<JobStats> {
        manager::job_stats(self.storage.as_ref()).await
    }

    /// Administrative operations over the same connection.
    pub fn manager(&self) -> JobManager {
        JobManager::new(self.storage.clone())
    }

    /// The storage connection this dispatcher uses.
    pub fn storage(&self) -> Arc<dyn StorageBackend> {
        self.storage.clone()
    }

    /// The queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("driver", &self.driver_config.driver)
            .field("lock_dir", &self.config.lock_dir)
            .finish()
    }
}

/// Fluent description of one job, terminated by [`JobHandle::dispatch`] or
/// [`JobHandle::dispatch_now`].
#[derive(Debug)]
pub struct JobHandle<'a> {
    dispatcher: &'a Dispatcher,
    callable: Callable,
    params: Value,
    name: String,
    priority: JobPriority,
    max_retries: i64,
    timeout: i64,
    retry_delay: i64,
    path_files: Option<PathBuf>,
}

impl JobHandle<'_> {
    /// Override the human label (defaults to the callable's own label).
    pub fn set_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Dispatch ordering class. Defaults to [`JobPriority::Normal`].
    pub fn set_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Retry budget. Defaults to 3.
    pub fn set_max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Wall-clock seconds allowed per attempt. Defaults to 14 400 (4 hours).
    ///
    /// Enforced with `tokio::time::timeout`: the attempt's future is
    /// cancelled at the deadline, so handlers doing blocking work should
    /// run it via `spawn_blocking` to stay cancellable.
    pub fn set_timeout(mut self, seconds: i64) -> Self {
        self.timeout = seconds;
        self
    }

    /// Seconds the worker sleeps before requeueing a retryable failure.
    /// Defaults to 5.
    pub fn set_retry_delay(mut self, seconds: i64) -> Self {
        self.retry_delay = seconds;
        self
    }

    /// File the worker verifies and records before the first attempt.
    pub fn set_include_path_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.path_files = Some(path.into());
        self
    }

    /// Persist the job and make sure a worker is running. Returns the job's
    /// external uuid.
    #[instrument(name = "dispatchq.dispatch", skip(self), fields(job.name = %self.name))]
    pub async fn dispatch(self) -> Result<Uuid> {
        self.validate()?;

        let encoded = self.dispatcher.codec.encode(&self.callable)?;
        let params = self.dispatcher.codec.encode_params(&self.params);
        let uuid = Uuid::new_v4();
        let now = Utc::now();

        let storage = self.dispatcher.storage.as_ref();
        storage.begin().await.map_err(Error::from)?;
        let inserted = storage
            .insert(
                JOBS_TABLE,
                vec![
                    ("uuid".into(), SqlValue::from(uuid.to_string())),
                    ("name".into(), SqlValue::from(self.name.clone())),
                    (
                        "callable_type".into(),
                        SqlValue::from(encoded.kind.as_str()),
                    ),
                    ("callable".into(), SqlValue::from(encoded.callable)),
                    ("namespace".into(), SqlValue::from(encoded.namespace)),
                    (
                        "object_instance".into(),
                        SqlValue::from(encoded.object_instance),
                    ),
                    (
                        "path_files".into(),
                        SqlValue::from(
                            self.path_files
                                .as_ref()
                                .map(|p| p.to_string_lossy().into_owned()),
                        ),
                    ),
                    ("params".into(), SqlValue::from(params)),
                    ("status".into(), SqlValue::from(JobStatus::Pending.as_str())),
                    ("priority".into(), SqlValue::from(self.priority.as_str())),
                    ("timeout".into(), SqlValue::Int(self.timeout)),
                    ("retry_count".into(), SqlValue::Int(0)),
                    ("max_retries".into(), SqlValue::Int(self.max_retries)),
                    ("retry_delay".into(), SqlValue::Int(self.retry_delay)),
                    ("created_at".into(), SqlValue::from(now)),
                ],
            )
            .await;

        match inserted {
            Ok(_) => storage.commit().await.map_err(Error::from)?,
            Err(error) => {
                let _ = storage.rollback().await;
                return Err(Error::DispatchFailed(error.to_string()));
            }
        }

        debug!(%uuid, "Job persisted");

        // The job is durable at this point; a spawn failure only delays
        // draining until the next dispatch retries it.
        if let Err(error) = self
            .dispatcher
            .supervisor
            .ensure_worker_running(&self.dispatcher.driver_config)
            .await
        {
            warn!(%error, "Could not ensure a worker is running");
        }

        Ok(uuid)
    }

    /// Skip persistence and run the callable immediately under the
    /// configured timeout, propagating its result or error.
    pub async fn dispatch_now(self) -> Result<Value> {
        self.validate()?;

        let key = self.callable.registry_key();
        let handler = self
            .dispatcher
            .registry
            .get(&key)
            .ok_or_else(|| Error::InvalidCallable(format!("no handler registered for {key:?}")))?
            .clone();

        let invocation = Invocation {
            params: self.params.clone(),
            instance: self.callable.instance().cloned(),
            captured: self.callable.captured().cloned(),
        };

        let attempt = AssertUnwindSafe(handler(invocation)).catch_unwind();
        match tokio::time::timeout(Duration::from_secs(self.timeout as u64), attempt).await {
            Err(_) => Err(Error::JobTimeout(self.timeout)),
            Ok(Err(panic)) => Err(Error::User(crate::worker::panic_to_error(&*panic))),
            Ok(Ok(Err(error))) => Err(Error::User(error)),
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.timeout < 1 {
            return Err(Error::InvalidArgument(format!(
                "timeout must be positive, got {}",
                self.timeout
            )));
        }
        if self.max_retries < 0 {
            return Err(Error::InvalidArgument(format!(
                "max_retries must be non-negative, got {}",
                self.max_retries
            )));
        }
        if self.retry_delay < 0 {
            return Err(Error::InvalidArgument(format!(
                "retry_delay must be non-negative, got {}",
                self.retry_delay
            )));
        }
        if let Some(path) = &self.path_files {
            if !path.exists() {
                return Err(Error::InvalidArgument(format!(
                    "preload path does not exist: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}
