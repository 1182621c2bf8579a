//! Management surface: stats, lookups, manual retries, failed-job reaping.

use crate::errors::{Error, Result, StorageError};
use crate::job::{FailedJob, Job, JobStats, JobStatus};
use crate::schema::{FAILED_JOBS_TABLE, JOBS_TABLE};
use crate::storage::{SqlValue, StorageBackend};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

/// Load a job by its external uuid.
pub(crate) async fn find_job_by_uuid(
    storage: &dyn StorageBackend,
    uuid: &str,
) -> Result<Option<Job>> {
    let sql = format!(
        "SELECT {} FROM {JOBS_TABLE} WHERE uuid = ? LIMIT 1",
        Job::COLUMNS
    );
    let rows = storage.query(&sql, vec![SqlValue::from(uuid)]).await?;
    match rows.first() {
        Some(row) => Ok(Some(Job::from_row(row)?)),
        None => Ok(None),
    }
}

/// One query producing the totals per status plus average completion latency.
pub(crate) async fn job_stats(storage: &dyn StorageBackend) -> Result<JobStats> {
    let latency = storage
        .dialect()
        .seconds_between("created_at", "completed_at");
    let sql = format!(
        "SELECT COUNT(*) AS total, \
         COUNT(CASE WHEN status = 'pending' THEN 1 END) AS pending, \
         COUNT(CASE WHEN status = 'processing' THEN 1 END) AS processing, \
         COUNT(CASE WHEN status = 'completed' THEN 1 END) AS completed, \
         COUNT(CASE WHEN status = 'failed' THEN 1 END) AS failed, \
         AVG(CASE WHEN status = 'completed' THEN {latency} END) AS avg_completion_seconds \
         FROM {JOBS_TABLE}"
    );
    let rows = storage.query(&sql, Vec::new()).await?;
    let row = rows
        .first()
        .ok_or_else(|| StorageError::new("stats query returned no rows"))?;
    Ok(JobStats {
        total: row.int("total")?,
        pending: row.int("pending")?,
        processing: row.int("processing")?,
        completed: row.int("completed")?,
        failed: row.int("failed")?,
        avg_completion_seconds: row.opt_float("avg_completion_seconds")?,
    })
}

/// Administrative operations over the queue tables.
#[derive(Clone)]
pub struct JobManager {
    storage: Arc<dyn StorageBackend>,
}

impl JobManager {
    /// Build a manager over an existing storage connection.
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Look up a job by uuid.
    pub async fn get_job_status(&self, uuid: &str) -> Result<Option<Job>> {
        find_job_by_uuid(self.storage.as_ref(), uuid).await
    }

    /// Aggregate counters and completion latency.
    pub async fn get_job_stats(&self) -> Result<JobStats> {
        job_stats(self.storage.as_ref()).await
    }

    /// Requeue one job that still has retry budget.
    pub async fn retry_job(&self, uuid: &str) -> Result<()> {
        self.storage.begin().await?;
        let result = self.retry_job_tx(uuid).await;
        match result {
            Ok(()) => {
                self.storage.commit().await?;
                info!(uuid, "Job requeued");
                Ok(())
            }
            Err(error) => {
                let _ = self.storage.rollback().await;
                Err(error)
            }
        }
    }

    async fn retry_job_tx(&self, uuid: &str) -> Result<()> {
        let job = find_job_by_uuid(self.storage.as_ref(), uuid)
            .await?
            .ok_or_else(|| Error::InvalidArgument(format!("no job with uuid {uuid}")))?;
        if job.retry_count >= job.max_retries {
            return Err(Error::InvalidArgument(format!(
                "job {uuid} has exhausted its retry budget ({}/{})",
                job.retry_count, job.max_retries
            )));
        }
        self.storage
            .update(
                JOBS_TABLE,
                job.id,
                vec![
                    ("status".into(), SqlValue::from(JobStatus::Pending.as_str())),
                    ("retry_count".into(), SqlValue::Int(job.retry_count + 1)),
                    ("pid".into(), SqlValue::Null),
                    ("updated_at".into(), SqlValue::from(Utc::now())),
                ],
            )
            .await?;
        Ok(())
    }

    /// Requeue every failed job that still has retry budget, oldest first.
    /// Returns the number of jobs requeued.
    pub async fn retry_all_failed(&self) -> Result<u64> {
        self.storage.begin().await?;
        let result = self.retry_all_failed_tx().await;
        match result {
            Ok(count) => {
                self.storage.commit().await?;
                info!(count, "Requeued failed jobs");
                Ok(count)
            }
            Err(error) => {
                let _ = self.storage.rollback().await;
                Err(error)
            }
        }
    }

    async fn retry_all_failed_tx(&self) -> Result<u64> {
        let sql = format!(
            "SELECT {} FROM {JOBS_TABLE} \
             WHERE status = 'failed' AND retry_count < max_retries \
             ORDER BY created_at ASC",
            Job::COLUMNS
        );
        let rows = self.storage.query(&sql, Vec::new()).await?;
        let mut count = 0;
        for row in &rows {
            let job = Job::from_row(row)?;
            let updated = self
                .storage
                .update(
                    JOBS_TABLE,
                    job.id,
                    vec![
                        ("status".into(), SqlValue::from(JobStatus::Pending.as_str())),
                        ("retry_count".into(), SqlValue::Int(job.retry_count + 1)),
                        ("pid".into(), SqlValue::Null),
                        ("updated_at".into(), SqlValue::from(Utc::now())),
                    ],
                )
                .await?;
            if updated {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Delete failed-job records older than `days_old` days. Returns the
    /// number of rows removed.
    pub async fn clear_failed_jobs(&self, days_old: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days_old));
        let sql = format!("DELETE FROM {FAILED_JOBS_TABLE} WHERE failed_at < ?");
        let affected = self
            .storage
            .execute(&sql, vec![SqlValue::from(cutoff)])
            .await?;
        debug!(affected, days_old, "Cleared failed job records");
        Ok(affected)
    }

    /// Most recent failed-job records, for forensics.
    pub async fn get_failed_jobs(&self, limit: i64) -> Result<Vec<FailedJob>> {
        let sql = format!(
            "SELECT id, uuid, job_id, exception, payload, failed_at \
             FROM {FAILED_JOBS_TABLE} ORDER BY failed_at DESC LIMIT ?"
        );
        let rows = self.storage.query(&sql, vec![SqlValue::Int(limit)]).await?;
        rows.iter()
            .map(|row| FailedJob::from_row(row).map_err(Error::from))
            .collect()
    }

    /// List jobs, optionally filtered by status, newest first.
    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        let (sql, params) = match status {
            Some(status) => (
                format!(
                    "SELECT {} FROM {JOBS_TABLE} WHERE status = ? \
                     ORDER BY created_at DESC, id DESC LIMIT ?",
                    Job::COLUMNS
                ),
                vec![SqlValue::from(status.as_str()), SqlValue::Int(limit)],
            ),
            None => (
                format!(
                    "SELECT {} FROM {JOBS_TABLE} ORDER BY created_at DESC, id DESC LIMIT ?",
                    Job::COLUMNS
                ),
                vec![SqlValue::Int(limit)],
            ),
        };
        let rows = self.storage.query(&sql, params).await?;
        rows.iter()
            .map(|row| Job::from_row(row).map_err(Error::from))
            .collect()
    }
}
