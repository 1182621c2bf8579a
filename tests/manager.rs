#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use claims::{assert_ge, assert_some};
use dispatchq::{
    schema, Callable, Dispatcher, DriverConfig, Error, JobRegistry, JobStatus, QueueConfig, Worker,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Test utilities and common setup
mod test_utils {
    use super::*;

    pub(super) struct TestQueue {
        pub(super) dispatcher: Dispatcher,
        pub(super) registry: Arc<JobRegistry>,
        pub(super) config: QueueConfig,
        pub(super) db_url: String,
        _dir: TempDir,
    }

    pub(super) async fn setup(registry: JobRegistry) -> anyhow::Result<TestQueue> {
        let dir = TempDir::new()?;
        let db_url = format!("sqlite://{}", dir.path().join("queue.db").display());
        let config = QueueConfig {
            process_check_interval_us: 10_000,
            lock_dir: dir.path().to_path_buf(),
            worker_binary: Some(PathBuf::from("true")),
            ..QueueConfig::default()
        };
        let registry = Arc::new(registry);
        let dispatcher = Dispatcher::new(
            DriverConfig::sqlite(db_url.clone()),
            config.clone(),
            registry.as_ref().clone(),
        )
        .await?;
        Ok(TestQueue {
            dispatcher,
            registry,
            config,
            db_url,
            _dir: dir,
        })
    }

    pub(super) async fn drain(queue: &TestQueue) {
        let worker = Worker::new(
            queue.dispatcher.storage(),
            queue.registry.clone(),
            queue.config.clone(),
        )
        .shutdown_when_queue_empty();
        worker.run().await;
    }

    /// Registry with one handler that always succeeds and one that always fails.
    pub(super) fn mixed_registry() -> JobRegistry {
        let mut registry = JobRegistry::new();
        registry.register_function("succeeds", |_inv| async move { Ok(Value::Null) });
        registry.register_function("fails", |_inv| async move {
            anyhow::bail!("persistent failure")
        });
        registry
    }
}

#[tokio::test]
async fn provisioning_is_idempotent() -> anyhow::Result<()> {
    let queue = test_utils::setup(JobRegistry::new()).await?;
    let storage = queue.dispatcher.storage();

    assert!(storage.table_exists(schema::JOBS_TABLE).await?);
    assert!(storage.table_exists(schema::FAILED_JOBS_TABLE).await?);

    // Running the provisioner again changes nothing and errors nowhere.
    schema::ensure_tables(storage.as_ref()).await?;

    // A second dispatcher over the same database provisions against
    // existing tables without complaint.
    let again = Dispatcher::new(
        DriverConfig::sqlite(queue.db_url.clone()),
        queue.config.clone(),
        JobRegistry::new(),
    )
    .await?;
    assert_eq!(again.get_job_stats().await?.total, 0);

    Ok(())
}

#[tokio::test]
async fn stats_aggregate_counts_and_latency() -> anyhow::Result<()> {
    let queue = test_utils::setup(test_utils::mixed_registry()).await?;

    for _ in 0..3 {
        queue
            .dispatcher
            .job(Callable::function("succeeds"), json!({}))
            .dispatch()
            .await?;
    }
    queue
        .dispatcher
        .job(Callable::function("fails"), json!({}))
        .set_max_retries(1)
        .set_retry_delay(0)
        .dispatch()
        .await?;

    let before = queue.dispatcher.get_job_stats().await?;
    assert_eq!(before.total, 4);
    assert_eq!(before.pending, 4);
    assert_eq!(before.avg_completion_seconds, None);

    test_utils::drain(&queue).await;

    let after = queue.dispatcher.get_job_stats().await?;
    assert_eq!(after.total, 4);
    assert_eq!(after.pending, 0);
    assert_eq!(after.processing, 0);
    assert_eq!(after.completed, 3);
    assert_eq!(after.failed, 1);
    let latency = assert_some!(after.avg_completion_seconds);
    assert_ge!(latency, 0.0);

    Ok(())
}

#[tokio::test]
async fn retry_job_requeues_a_failed_job_with_budget() -> anyhow::Result<()> {
    let queue = test_utils::setup(test_utils::mixed_registry()).await?;

    // max_retries=2 fails terminally with retry_count=1, leaving budget on
    // the stored counter.
    let uuid = queue
        .dispatcher
        .job(Callable::function("fails"), json!({}))
        .set_max_retries(2)
        .set_retry_delay(0)
        .dispatch()
        .await?;
    test_utils::drain(&queue).await;

    let manager = queue.dispatcher.manager();
    let job = assert_some!(manager.get_job_status(&uuid.to_string()).await?);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 1);

    manager.retry_job(&uuid.to_string()).await?;

    let job = assert_some!(manager.get_job_status(&uuid.to_string()).await?);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.pid, None);

    // A second manual retry finds the budget exhausted.
    let error = manager.retry_job(&uuid.to_string()).await.unwrap_err();
    assert!(matches!(error, Error::InvalidArgument(_)));

    Ok(())
}

#[tokio::test]
async fn retry_job_rejects_unknown_uuids() -> anyhow::Result<()> {
    let queue = test_utils::setup(JobRegistry::new()).await?;
    let error = queue
        .dispatcher
        .manager()
        .retry_job("00000000-0000-4000-8000-000000000000")
        .await
        .unwrap_err();
    assert!(matches!(error, Error::InvalidArgument(_)));
    Ok(())
}

#[tokio::test]
async fn retry_all_failed_requeues_only_jobs_with_budget() -> anyhow::Result<()> {
    let queue = test_utils::setup(test_utils::mixed_registry()).await?;

    // Two terminal failures with leftover budget on the stored counter,
    // plus one whose counter gets burned below so it no longer qualifies.
    let mut uuids = Vec::new();
    for _ in 0..2 {
        let uuid = queue
            .dispatcher
            .job(Callable::function("fails"), json!({}))
            .set_max_retries(3)
            .set_retry_delay(0)
            .dispatch()
            .await?;
        uuids.push(uuid);
    }
    let exhausted = queue
        .dispatcher
        .job(Callable::function("fails"), json!({}))
        .set_max_retries(2)
        .set_retry_delay(0)
        .dispatch()
        .await?;
    test_utils::drain(&queue).await;

    // Burn the third job's remaining counter so it no longer qualifies.
    let storage = queue.dispatcher.storage();
    storage
        .execute(
            "UPDATE jobs SET retry_count = max_retries WHERE uuid = ?",
            vec![dispatchq::SqlValue::from(exhausted.to_string())],
        )
        .await?;

    let manager = queue.dispatcher.manager();
    let requeued = manager.retry_all_failed().await?;
    assert_eq!(requeued, 2);

    for uuid in &uuids {
        let job = assert_some!(manager.get_job_status(&uuid.to_string()).await?);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 3);
    }
    let job = assert_some!(manager.get_job_status(&exhausted.to_string()).await?);
    assert_eq!(job.status, JobStatus::Failed);

    Ok(())
}

#[tokio::test]
async fn clear_failed_jobs_respects_the_age_window() -> anyhow::Result<()> {
    let queue = test_utils::setup(test_utils::mixed_registry()).await?;

    queue
        .dispatcher
        .job(Callable::function("fails"), json!({}))
        .set_max_retries(1)
        .set_retry_delay(0)
        .dispatch()
        .await?;
    test_utils::drain(&queue).await;

    let manager = queue.dispatcher.manager();
    assert_eq!(manager.get_failed_jobs(10).await?.len(), 1);

    // The record is seconds old: a thirty day window keeps it.
    assert_eq!(manager.clear_failed_jobs(30).await?, 0);
    assert_eq!(manager.get_failed_jobs(10).await?.len(), 1);

    // A zero day window reaps everything older than this instant.
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert_eq!(manager.clear_failed_jobs(0).await?, 1);
    assert_eq!(manager.get_failed_jobs(10).await?.len(), 0);

    Ok(())
}

#[tokio::test]
async fn list_jobs_filters_by_status() -> anyhow::Result<()> {
    let queue = test_utils::setup(test_utils::mixed_registry()).await?;

    for _ in 0..2 {
        queue
            .dispatcher
            .job(Callable::function("succeeds"), json!({}))
            .dispatch()
            .await?;
    }
    queue
        .dispatcher
        .job(Callable::function("fails"), json!({}))
        .set_max_retries(1)
        .set_retry_delay(0)
        .dispatch()
        .await?;
    test_utils::drain(&queue).await;

    let manager = queue.dispatcher.manager();
    assert_eq!(manager.list_jobs(None, 10).await?.len(), 3);
    assert_eq!(
        manager
            .list_jobs(Some(JobStatus::Completed), 10)
            .await?
            .len(),
        2
    );
    assert_eq!(manager.list_jobs(Some(JobStatus::Failed), 10).await?.len(), 1);
    assert_eq!(manager.list_jobs(Some(JobStatus::Pending), 10).await?.len(), 0);
    assert_eq!(manager.list_jobs(None, 2).await?.len(), 2);

    Ok(())
}

#[tokio::test]
async fn completed_jobs_are_never_mutated_by_another_drain() -> anyhow::Result<()> {
    let queue = test_utils::setup(test_utils::mixed_registry()).await?;

    let uuid = queue
        .dispatcher
        .job(Callable::function("succeeds"), json!({}))
        .dispatch()
        .await?;
    test_utils::drain(&queue).await;

    let first = assert_some!(queue.dispatcher.get_job_status(&uuid.to_string()).await?);
    assert_eq!(first.status, JobStatus::Completed);

    // A second drain finds nothing to lease.
    test_utils::drain(&queue).await;
    let second = assert_some!(queue.dispatcher.get_job_status(&uuid.to_string()).await?);
    assert_eq!(second.completed_at, first.completed_at);
    assert_eq!(second.updated_at, first.updated_at);

    Ok(())
}
