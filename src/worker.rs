//! The execution loop: lease one job at a time, run it under its timeout,
//! classify the outcome, and write the next state back.

use crate::callable::CallableCodec;
use crate::config::QueueConfig;
use crate::errors::{Error, Result};
use crate::job::{Job, JobStatus};
use crate::registry::{Invocation, JobRegistry};
use crate::retry::{self, RetryDecision};
use crate::schema::{FAILED_JOBS_TABLE, JOBS_TABLE};
use crate::storage::{SqlValue, StorageBackend};
use chrono::Utc;
use futures_util::FutureExt;
use rand::Rng;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// Drains the queue sequentially: one leased job at a time.
pub struct Worker {
    storage: Arc<dyn StorageBackend>,
    registry: Arc<JobRegistry>,
    codec: CallableCodec,
    config: QueueConfig,
    pid: String,
    should_run: Arc<AtomicBool>,
    shutdown_when_queue_empty: bool,
    jitter: Duration,
    preloaded: Mutex<HashSet<PathBuf>>,
}

impl Worker {
    /// Build a worker over an existing storage connection.
    pub fn new(storage: Arc<dyn StorageBackend>, registry: Arc<JobRegistry>, config: QueueConfig) -> Self {
        let codec = CallableCodec::new(config.secret());
        Self {
            storage,
            registry,
            codec,
            config,
            pid: std::process::id().to_string(),
            should_run: Arc::new(AtomicBool::new(true)),
            shutdown_when_queue_empty: false,
            jitter: DEFAULT_JITTER,
            preloaded: Mutex::new(HashSet::new()),
        }
    }

    /// Stop once no pending work remains, instead of polling forever.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Flag checked between iterations; flip to `false` to stop after the
    /// current job.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.should_run.clone()
    }

    /// Install SIGTERM/SIGINT handlers that request a cooperative shutdown.
    /// The in-flight job finishes under its own timeout.
    pub fn install_signal_handler(&self) {
        let flag = self.should_run.clone();
        #[cfg(unix)]
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
                warn!("Failed to install SIGTERM handler");
                return;
            };
            let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
                warn!("Failed to install SIGINT handler");
                return;
            };
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, finishing current job"),
                _ = sigint.recv() => info!("Received SIGINT, finishing current job"),
            }
            flag.store(false, Ordering::Relaxed);
        });
        #[cfg(not(unix))]
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C, finishing current job");
                flag.store(false, Ordering::Relaxed);
            }
        });
    }

    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.config.poll_interval();
        }
        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.config.poll_interval() + Duration::from_millis(random_jitter)
    }

    /// Drain jobs until shutdown is requested, the worker lifetime elapses,
    /// or (when configured) the queue runs dry.
    pub async fn run(&self) {
        let started = Instant::now();
        let lifetime = self.config.worker_timeout();

        while self.should_run.load(Ordering::Relaxed) {
            match self.lease_next().await {
                Ok(Some(job)) => {
                    let span = info_span!("job", job.id = %job.id, job.uuid = %job.uuid);
                    self.run_job(job).instrument(span).await;
                }
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No pending jobs found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No pending jobs found. Polling again in {sleep_duration:?}…");
                    sleep(sleep_duration).await;
                }
                Err(error) => {
                    error!(%error, "Failed to lease a job");
                    sleep(self.sleep_duration_with_jitter()).await;
                }
            }

            if started.elapsed() >= lifetime {
                info!("Worker lifetime of {lifetime:?} reached, exiting cleanly");
                break;
            }
        }
    }

    /// Atomically claim the next pending job: highest priority first, then
    /// oldest `created_at`, then smallest `id`. The select and the transition
    /// to `processing` happen in one transaction holding the row lock.
    async fn lease_next(&self) -> Result<Option<Job>> {
        let storage = self.storage.as_ref();
        let dialect = storage.dialect();

        storage.begin().await.map_err(Error::from)?;
        let leased = async {
            let sql = format!(
                "SELECT {} FROM {JOBS_TABLE} \
                 WHERE status = 'pending' AND (retry_count < max_retries OR retry_count = 0) \
                 ORDER BY {} ASC, created_at ASC, id ASC LIMIT 1{}",
                Job::COLUMNS,
                dialect.priority_rank("priority"),
                dialect.row_lock_clause(),
            );
            let rows = storage.query(&sql, Vec::new()).await?;
            let Some(row) = rows.first() else {
                return Ok(None);
            };
            let mut job = Job::from_row(row)?;

            let now = Utc::now();
            let update_sql = format!(
                "UPDATE {JOBS_TABLE} SET status = 'processing', pid = ?, updated_at = ?, \
                 started_at = COALESCE(started_at, ?) WHERE id = ?"
            );
            storage
                .execute(
                    &update_sql,
                    vec![
                        SqlValue::from(self.pid.clone()),
                        SqlValue::from(now),
                        SqlValue::from(now),
                        SqlValue::Int(job.id),
                    ],
                )
                .await?;

            job.status = JobStatus::Processing;
            job.pid = Some(self.pid.clone());
            job.started_at.get_or_insert(now);
            job.updated_at = Some(now);
            Ok(Some(job))
        }
        .await;

        match leased {
            Ok(job) => {
                storage.commit().await.map_err(Error::from)?;
                Ok(job)
            }
            Err(error) => {
                let _ = storage.rollback().await;
                Err(error)
            }
        }
    }

    async fn run_job(&self, job: Job) {
        debug!(job.name = %job.name, "Running job…");
        match self.execute(&job).await {
            Ok(_) => self.record_success(&job).await,
            Err(error) => {
                warn!(%error, "Job attempt failed");
                self.record_failure(&job, &error).await;
            }
        }
    }

    /// Run one attempt: preload, decode, resolve, invoke under the job's
    /// wall-clock budget.
    async fn execute(&self, job: &Job) -> Result<serde_json::Value> {
        if let Some(path) = &job.path_files {
            self.preload(PathBuf::from(path))?;
        }

        let callable = self.codec.decode(
            job.callable_type,
            &job.callable,
            job.namespace.as_deref(),
            job.object_instance.as_deref(),
        )?;
        let params = self.codec.decode_params(&job.params)?;

        let key = callable.registry_key();
        let handler = self
            .registry
            .get(&key)
            .ok_or_else(|| Error::User(anyhow::anyhow!("no handler registered for {key:?}")))?
            .clone();

        let invocation = Invocation {
            params,
            instance: callable.instance().cloned(),
            captured: callable.captured().cloned(),
        };

        let attempt = AssertUnwindSafe(handler(invocation)).catch_unwind();
        match tokio::time::timeout(Duration::from_secs(job.timeout.max(0) as u64), attempt).await {
            Err(_) => Err(Error::JobTimeout(job.timeout)),
            Ok(Err(panic)) => Err(Error::User(panic_to_error(&*panic))),
            Ok(Ok(Err(error))) => Err(Error::User(error)),
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }

    /// Record a preload file once per worker process. Repeated attempts for
    /// the same path are no-ops.
    fn preload(&self, path: PathBuf) -> Result<()> {
        let mut loaded = self.preloaded.lock().unwrap_or_else(|e| e.into_inner());
        if loaded.contains(&path) {
            return Ok(());
        }
        if !path.exists() {
            return Err(Error::PreloadMissing(path));
        }
        debug!(path = %path.display(), "Preload file verified");
        loaded.insert(path);
        Ok(())
    }

    async fn record_success(&self, job: &Job) {
        let now = Utc::now();
        let result = self
            .storage
            .update(
                JOBS_TABLE,
                job.id,
                vec![
                    (
                        "status".into(),
                        SqlValue::from(JobStatus::Completed.as_str()),
                    ),
                    ("completed_at".into(), SqlValue::from(now)),
                    ("updated_at".into(), SqlValue::from(now)),
                ],
            )
            .await;
        match result {
            Ok(_) => debug!("Job completed"),
            Err(error) => error!(%error, "Failed to record job completion"),
        }
    }

    async fn record_failure(&self, job: &Job, failure: &Error) {
        match retry::decide(job.retry_count, job.max_retries, failure) {
            RetryDecision::Retry { next_retry_count } => {
                let result = self
                    .storage
                    .update(
                        JOBS_TABLE,
                        job.id,
                        vec![
                            ("status".into(), SqlValue::from(JobStatus::Pending.as_str())),
                            ("retry_count".into(), SqlValue::Int(next_retry_count)),
                            ("pid".into(), SqlValue::Null),
                            ("updated_at".into(), SqlValue::from(Utc::now())),
                        ],
                    )
                    .await;
                match result {
                    Ok(_) => debug!(
                        retry_count = next_retry_count,
                        delay = job.retry_delay,
                        "Job requeued for retry"
                    ),
                    Err(error) => error!(%error, "Failed to requeue job"),
                }
                if job.retry_delay > 0 {
                    sleep(Duration::from_secs(job.retry_delay as u64)).await;
                }
            }
            RetryDecision::Terminal => self.record_terminal_failure(job, failure).await,
        }
    }

    /// Move the row to `failed` and write the audit record in one
    /// transaction. A secondary storage failure here is logged and swallowed
    /// so the loop keeps draining.
    async fn record_terminal_failure(&self, job: &Job, failure: &Error) {
        let exception = match failure {
            Error::User(inner) => format!("{inner:?}"),
            other => other.to_string(),
        };
        let payload = job.snapshot().to_string();
        let now = Utc::now();

        let storage = self.storage.as_ref();
        let written = async {
            storage.begin().await?;
            let result = async {
                storage
                    .update(
                        JOBS_TABLE,
                        job.id,
                        vec![
                            ("status".into(), SqlValue::from(JobStatus::Failed.as_str())),
                            ("updated_at".into(), SqlValue::from(now)),
                        ],
                    )
                    .await?;
                storage
                    .insert(
                        FAILED_JOBS_TABLE,
                        vec![
                            ("uuid".into(), SqlValue::from(job.uuid.clone())),
                            ("job_id".into(), SqlValue::Int(job.id)),
                            ("exception".into(), SqlValue::from(exception)),
                            ("payload".into(), SqlValue::from(payload)),
                            ("failed_at".into(), SqlValue::from(now)),
                        ],
                    )
                    .await?;
                Ok::<(), crate::errors::StorageError>(())
            }
            .await;
            match result {
                Ok(()) => storage.commit().await,
                Err(error) => {
                    let _ = storage.rollback().await;
                    Err(error)
                }
            }
        }
        .await;

        match written {
            Ok(()) => info!(retries = job.retry_count, "Job failed terminally"),
            Err(error) => error!(%error, "Failed to record terminal failure"),
        }
    }
}

/// Turn a caught panic payload into an error, keeping the panic message when
/// it is a string.
pub(crate) fn panic_to_error(panic: &(dyn std::any::Any + Send)) -> anyhow::Error {
    if let Some(message) = panic.downcast_ref::<&str>() {
        anyhow::anyhow!("job panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        anyhow::anyhow!("job panicked: {message}")
    } else {
        anyhow::anyhow!("job panicked")
    }
}
