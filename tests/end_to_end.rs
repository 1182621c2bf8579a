#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use claims::{assert_none, assert_some};
use dispatchq::{
    Callable, Dispatcher, DriverConfig, Error, JobPriority, JobRegistry, JobStatus, QueueConfig,
    SqlValue, Worker,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Test utilities and common setup
mod test_utils {
    use super::*;

    /// Queue state for one test: a scratch directory holding the sqlite
    /// database and the worker lock file.
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
            secret_key: Some("integration-test-secret".to_string()),
            // Dispatch probes for a worker process on every call; spawn
            // something inert instead of a real worker so the in-process
            // worker below is the only consumer.
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

    /// Run an in-process worker until the queue is drained.
    pub(super) async fn drain(queue: &TestQueue) {
        let worker = Worker::new(
            queue.dispatcher.storage(),
            queue.registry.clone(),
            queue.config.clone(),
        )
        .shutdown_when_queue_empty();
        worker.run().await;
    }

    pub(super) async fn failed_job_count(queue: &TestQueue) -> anyhow::Result<i64> {
        let rows = queue
            .dispatcher
            .storage()
            .query("SELECT COUNT(*) AS n FROM failed_jobs", Vec::new())
            .await?;
        Ok(rows[0].int("n")?)
    }
}

#[tokio::test]
async fn happy_path_completes_without_failures() -> anyhow::Result<()> {
    let mut registry = JobRegistry::new();
    registry.register_function("add", |inv| async move {
        let a = inv.params["a"].as_i64().unwrap_or(0);
        let b = inv.params["b"].as_i64().unwrap_or(0);
        Ok(json!(a + b))
    });

    let queue = test_utils::setup(registry).await?;
    let uuid = queue
        .dispatcher
        .job(Callable::function("add"), json!({"a": 2, "b": 3}))
        .set_max_retries(3)
        .set_timeout(10)
        .dispatch()
        .await?;

    test_utils::drain(&queue).await;

    let job = assert_some!(queue.dispatcher.get_job_status(&uuid.to_string()).await?);
    assert_eq!(job.status, JobStatus::Completed);
    assert_some!(job.completed_at);
    assert_some!(job.started_at);
    assert_eq!(job.retry_count, 0);
    assert_eq!(test_utils::failed_job_count(&queue).await?, 0);

    Ok(())
}

#[tokio::test]
async fn urgent_preempts_high_preempts_normal() -> anyhow::Result<()> {
    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    let recorder = order.clone();

    let mut registry = JobRegistry::new();
    registry.register_function("record", move |inv| {
        let recorder = recorder.clone();
        async move {
            let tag = inv.params["tag"].as_str().unwrap_or("?").to_string();
            recorder.lock().unwrap().push(tag);
            Ok(Value::Null)
        }
    });

    let queue = test_utils::setup(registry).await?;
    for (tag, priority) in [
        ("A", JobPriority::Normal),
        ("B", JobPriority::Urgent),
        ("C", JobPriority::High),
    ] {
        queue
            .dispatcher
            .job(Callable::function("record"), json!({"tag": tag}))
            .set_priority(priority)
            .dispatch()
            .await?;
    }

    test_utils::drain(&queue).await;

    assert_eq!(*order.lock().unwrap(), vec!["B", "C", "A"]);
    Ok(())
}

#[tokio::test]
async fn equal_priority_jobs_run_oldest_first() -> anyhow::Result<()> {
    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    let recorder = order.clone();

    let mut registry = JobRegistry::new();
    registry.register_function("record", move |inv| {
        let recorder = recorder.clone();
        async move {
            recorder
                .lock()
                .unwrap()
                .push(inv.params["tag"].as_str().unwrap_or("?").to_string());
            Ok(Value::Null)
        }
    });

    let queue = test_utils::setup(registry).await?;
    for tag in ["first", "second", "third"] {
        queue
            .dispatcher
            .job(Callable::function("record"), json!({"tag": tag}))
            .dispatch()
            .await?;
    }

    test_utils::drain(&queue).await;

    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    Ok(())
}

#[tokio::test]
async fn concurrent_leases_from_independent_connections_are_exclusive() -> anyhow::Result<()> {
    let runs = Arc::new(AtomicU8::new(0));
    let counter = runs.clone();

    let mut registry = JobRegistry::new();
    registry.register_function("count_once", move |_inv| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            // Hold the job long enough that a double lease would register
            // both invocations before either worker drains out.
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Value::Null)
        }
    });

    let queue = test_utils::setup(registry).await?;
    let uuid = queue
        .dispatcher
        .job(Callable::function("count_once"), json!({}))
        .dispatch()
        .await?;

    // A second, fully independent connection to the same database file. The
    // first backend's in-process transaction slot plays no part in excluding
    // this one; only the database's own locking can.
    let other = Dispatcher::new(
        DriverConfig::sqlite(queue.db_url.clone()),
        queue.config.clone(),
        queue.registry.as_ref().clone(),
    )
    .await?;

    let worker_a = Worker::new(
        queue.dispatcher.storage(),
        queue.registry.clone(),
        queue.config.clone(),
    )
    .shutdown_when_queue_empty();
    let worker_b = Worker::new(other.storage(), queue.registry.clone(), queue.config.clone())
        .shutdown_when_queue_empty();

    // Race both workers at the single pending row.
    tokio::join!(worker_a.run(), worker_b.run());

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    let job = assert_some!(queue.dispatcher.get_job_status(&uuid.to_string()).await?);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 0);
    assert_eq!(test_utils::failed_job_count(&queue).await?, 0);

    Ok(())
}

#[tokio::test]
async fn failing_twice_then_succeeding_records_two_retries() -> anyhow::Result<()> {
    let attempts = Arc::new(AtomicU8::new(0));
    let counter = attempts.clone();

    let mut registry = JobRegistry::new();
    registry.register_function("flaky", move |_inv| {
        let counter = counter.clone();
        async move {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            if attempt < 2 {
                anyhow::bail!("transient failure on attempt {attempt}");
            }
            Ok(Value::Null)
        }
    });

    let queue = test_utils::setup(registry).await?;
    let uuid = queue
        .dispatcher
        .job(Callable::function("flaky"), json!({}))
        .set_max_retries(3)
        .set_retry_delay(0)
        .dispatch()
        .await?;

    test_utils::drain(&queue).await;

    let job = assert_some!(queue.dispatcher.get_job_status(&uuid.to_string()).await?);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(test_utils::failed_job_count(&queue).await?, 0);

    Ok(())
}

#[tokio::test]
async fn exhausted_budget_moves_the_job_to_failed() -> anyhow::Result<()> {
    let mut registry = JobRegistry::new();
    registry.register_function("always_fails", |_inv| async move {
        anyhow::bail!("boom")
    });

    let queue = test_utils::setup(registry).await?;
    let uuid = queue
        .dispatcher
        .job(Callable::function("always_fails"), json!({}))
        .set_max_retries(2)
        .set_retry_delay(0)
        .dispatch()
        .await?;

    test_utils::drain(&queue).await;

    let job = assert_some!(queue.dispatcher.get_job_status(&uuid.to_string()).await?);
    assert_eq!(job.status, JobStatus::Failed);
    // Terminal at next=2 with max_retries=2: the stored count stays below
    // the budget.
    assert_eq!(job.retry_count, 1);

    let failed = queue.dispatcher.manager().get_failed_jobs(10).await?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].job_id, job.id);
    assert_eq!(failed[0].uuid, job.uuid);
    assert!(failed[0].exception.contains("boom"));
    assert!(failed[0].payload.contains(&job.uuid));

    Ok(())
}

#[tokio::test]
async fn slow_job_times_out_and_fails() -> anyhow::Result<()> {
    let mut registry = JobRegistry::new();
    registry.register_function("sleeper", |_inv| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Value::Null)
    });

    let queue = test_utils::setup(registry).await?;
    let uuid = queue
        .dispatcher
        .job(Callable::function("sleeper"), json!({}))
        .set_timeout(1)
        .set_max_retries(1)
        .set_retry_delay(0)
        .dispatch()
        .await?;

    test_utils::drain(&queue).await;

    let job = assert_some!(queue.dispatcher.get_job_status(&uuid.to_string()).await?);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0);

    let failed = queue.dispatcher.manager().get_failed_jobs(10).await?;
    assert_eq!(failed.len(), 1);
    assert!(failed[0].exception.contains("timeout"));

    Ok(())
}

#[tokio::test]
async fn tampered_closure_fails_terminally_with_budget_remaining() -> anyhow::Result<()> {
    let mut registry = JobRegistry::new();
    registry.register_closure("send_digest", |_inv| async move { Ok(Value::Null) });

    let queue = test_utils::setup(registry).await?;
    let uuid = queue
        .dispatcher
        .job(
            Callable::closure("send_digest", json!({"user_id": 7})),
            json!({}),
        )
        .set_max_retries(5)
        .dispatch()
        .await?;

    // Out-of-band mutation of the stored payload, as a database-level
    // attacker without the application secret would do.
    let storage = queue.dispatcher.storage();
    let rows = storage
        .query(
            "SELECT callable FROM jobs WHERE uuid = ?",
            vec![SqlValue::from(uuid.to_string())],
        )
        .await?;
    let mutated = rows[0].text("callable")?.replace("7", "8");
    storage
        .execute(
            "UPDATE jobs SET callable = ? WHERE uuid = ?",
            vec![
                SqlValue::from(mutated),
                SqlValue::from(uuid.to_string()),
            ],
        )
        .await?;

    test_utils::drain(&queue).await;

    let job = assert_some!(queue.dispatcher.get_job_status(&uuid.to_string()).await?);
    assert_eq!(job.status, JobStatus::Failed);
    // Tamper detection bypasses the retry budget entirely.
    assert_eq!(job.retry_count, 0);

    let failed = queue.dispatcher.manager().get_failed_jobs(10).await?;
    assert_eq!(failed.len(), 1);
    assert!(failed[0].exception.contains("integrity"));

    Ok(())
}

#[tokio::test]
async fn missing_preload_file_is_a_retryable_failure() -> anyhow::Result<()> {
    let mut registry = JobRegistry::new();
    registry.register_function("needs_preload", |_inv| async move { Ok(Value::Null) });

    let queue = test_utils::setup(registry).await?;

    let preload_dir = TempDir::new()?;
    let preload = preload_dir.path().join("bootstrap.txt");
    std::fs::write(&preload, "symbols")?;

    let uuid = queue
        .dispatcher
        .job(Callable::function("needs_preload"), json!({}))
        .set_include_path_file(&preload)
        .set_max_retries(1)
        .set_retry_delay(0)
        .dispatch()
        .await?;

    // The path existed at dispatch time but is gone at execution time.
    std::fs::remove_file(&preload)?;
    test_utils::drain(&queue).await;

    let job = assert_some!(queue.dispatcher.get_job_status(&uuid.to_string()).await?);
    assert_eq!(job.status, JobStatus::Failed);
    let failed = queue.dispatcher.manager().get_failed_jobs(10).await?;
    assert!(failed[0].exception.contains("preload"));

    Ok(())
}

#[tokio::test]
async fn nonexistent_preload_path_fails_the_dispatch() -> anyhow::Result<()> {
    let mut registry = JobRegistry::new();
    registry.register_function("noop", |_inv| async move { Ok(Value::Null) });

    let queue = test_utils::setup(registry).await?;
    let result = queue
        .dispatcher
        .job(Callable::function("noop"), json!({}))
        .set_include_path_file("/definitely/not/here.txt")
        .dispatch()
        .await;

    assert!(matches!(result, Err(Error::InvalidArgument(_))));
    Ok(())
}

#[tokio::test]
async fn dispatch_now_runs_synchronously_without_persisting() -> anyhow::Result<()> {
    let mut registry = JobRegistry::new();
    registry.register_function("add", |inv| async move {
        let a = inv.params["a"].as_i64().unwrap_or(0);
        let b = inv.params["b"].as_i64().unwrap_or(0);
        Ok(json!(a + b))
    });
    registry.register_function("explode", |_inv| async move {
        anyhow::bail!("kaboom")
    });
    registry.register_function("sleeper", |_inv| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Value::Null)
    });

    let queue = test_utils::setup(registry).await?;

    let result = queue
        .dispatcher
        .job(Callable::function("add"), json!({"a": 2, "b": 3}))
        .dispatch_now()
        .await?;
    assert_eq!(result, json!(5));

    let error = queue
        .dispatcher
        .job(Callable::function("explode"), json!({}))
        .dispatch_now()
        .await
        .unwrap_err();
    assert!(matches!(error, Error::User(_)));
    assert!(error.to_string().contains("kaboom") || format!("{error:?}").contains("kaboom"));

    let error = queue
        .dispatcher
        .job(Callable::function("sleeper"), json!({}))
        .set_timeout(1)
        .dispatch_now()
        .await
        .unwrap_err();
    assert!(matches!(error, Error::JobTimeout(1)));

    // Nothing was persisted by any of the three calls.
    let stats = queue.dispatcher.get_job_stats().await?;
    assert_eq!(stats.total, 0);

    Ok(())
}

#[tokio::test]
async fn instance_method_receives_its_encoded_state() -> anyhow::Result<()> {
    let mut registry = JobRegistry::new();
    registry.register_method("Report", "render", |inv| async move {
        let rows = inv
            .instance
            .as_ref()
            .and_then(|i| i["rows"].as_i64())
            .unwrap_or(0);
        Ok(json!(rows))
    });

    let queue = test_utils::setup(registry).await?;
    let uuid = queue
        .dispatcher
        .job(
            Callable::instance_method("Report", "render", json!({"rows": 42})),
            json!({}),
        )
        .dispatch()
        .await?;

    test_utils::drain(&queue).await;

    let job = assert_some!(queue.dispatcher.get_job_status(&uuid.to_string()).await?);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.name, "Report::render");
    assert_eq!(job.callable_type, dispatchq::CallableKind::ClassMethod);

    Ok(())
}

#[tokio::test]
async fn panicking_handler_consumes_retry_budget() -> anyhow::Result<()> {
    let mut registry = JobRegistry::new();
    registry.register_function("panics", |_inv| async move {
        panic!("handler exploded");
    });

    let queue = test_utils::setup(registry).await?;
    let uuid = queue
        .dispatcher
        .job(Callable::function("panics"), json!({}))
        .set_max_retries(2)
        .set_retry_delay(0)
        .dispatch()
        .await?;

    test_utils::drain(&queue).await;

    let job = assert_some!(queue.dispatcher.get_job_status(&uuid.to_string()).await?);
    assert_eq!(job.status, JobStatus::Failed);
    let failed = queue.dispatcher.manager().get_failed_jobs(10).await?;
    assert!(failed[0].exception.contains("handler exploded"));

    Ok(())
}

#[tokio::test]
async fn unknown_job_uuid_reports_none() -> anyhow::Result<()> {
    let queue = test_utils::setup(JobRegistry::new()).await?;
    assert_none!(
        queue
            .dispatcher
            .get_job_status("00000000-0000-4000-8000-000000000000")
            .await?
    );
    Ok(())
}
