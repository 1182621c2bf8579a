//! Row types for the `jobs` and `failed_jobs` tables.

use crate::errors::{Error, StorageError};
use crate::storage::SqlRow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be leased by the worker.
    Pending,
    /// Leased; exactly one worker owns the row.
    Processing,
    /// Finished successfully. Never mutated again.
    Completed,
    /// Terminally failed; a `failed_jobs` row exists.
    Failed,
}

impl JobStatus {
    /// Text stored in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::InvalidArgument(format!("unknown status {other:?}"))),
        }
    }
}

/// Dispatch ordering class. Smaller rank leases first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    /// Rank 0.
    Urgent,
    /// Rank 1.
    High,
    /// Rank 2.
    #[default]
    Normal,
    /// Rank 3.
    Low,
}

impl JobPriority {
    /// Text stored in the `priority` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Urgent => "urgent",
            JobPriority::High => "high",
            JobPriority::Normal => "normal",
            JobPriority::Low => "low",
        }
    }

    /// Total order used by the leasing query: urgent(0) < high(1) < normal(2) < low(3).
    pub fn rank(&self) -> i32 {
        match self {
            JobPriority::Urgent => 0,
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "urgent" => Ok(JobPriority::Urgent),
            "high" => Ok(JobPriority::High),
            "normal" => Ok(JobPriority::Normal),
            "low" => Ok(JobPriority::Low),
            other => Err(Error::InvalidArgument(format!(
                "unknown priority {other:?}, expected one of urgent, high, normal, low"
            ))),
        }
    }
}

/// Decoding strategy selector for the stored callable descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallableKind {
    /// A registered named closure with a captured environment and integrity tag.
    #[serde(rename = "closure")]
    Closure,
    /// A (class, method) pair, static or instance-bound.
    #[serde(rename = "class-method")]
    ClassMethod,
    /// A plain named function.
    #[serde(rename = "function")]
    Function,
}

impl CallableKind {
    /// Text stored in the `callable_type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            CallableKind::Closure => "closure",
            CallableKind::ClassMethod => "class-method",
            CallableKind::Function => "function",
        }
    }
}

impl fmt::Display for CallableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallableKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "closure" => Ok(CallableKind::Closure),
            "class-method" => Ok(CallableKind::ClassMethod),
            "function" => Ok(CallableKind::Function),
            other => Err(Error::InvalidCallable(format!(
                "unknown callable type {other:?}"
            ))),
        }
    }
}

/// The durable record of one unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    /// Surrogate primary key.
    pub id: i64,
    /// Externally visible handle, UUIDv4 text.
    pub uuid: String,
    /// Human label.
    pub name: String,
    /// Selects the decoding strategy for `callable`.
    pub callable_type: CallableKind,
    /// Encoded callable descriptor.
    pub callable: String,
    /// Class name for `class-method` callables.
    pub namespace: Option<String>,
    /// Encoded receiver state for instance methods.
    pub object_instance: Option<String>,
    /// Filesystem path to preload before execution.
    pub path_files: Option<String>,
    /// Encoded argument list.
    pub params: String,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Dispatch ordering class.
    pub priority: JobPriority,
    /// Owning worker identifier while processing.
    pub pid: Option<String>,
    /// Max wall-clock seconds per attempt.
    pub timeout: i64,
    /// Attempts already consumed.
    pub retry_count: i64,
    /// Retry budget.
    pub max_retries: i64,
    /// Seconds to sleep before requeueing a retryable failure.
    pub retry_delay: i64,
    /// When the first attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Insertion time. Retries keep the original value.
    pub created_at: DateTime<Utc>,
    /// Last state transition.
    pub updated_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Column list used by every `SELECT` over the jobs table, in `from_row` order.
    pub const COLUMNS: &'static str = "id, uuid, name, callable_type, callable, namespace, \
         object_instance, path_files, params, status, priority, pid, timeout, retry_count, \
         max_retries, retry_delay, started_at, completed_at, created_at, updated_at";

    /// Build a `Job` from a neutral storage row.
    pub fn from_row(row: &SqlRow) -> Result<Self, StorageError> {
        let status: JobStatus = row
            .text("status")?
            .parse()
            .map_err(|e: Error| StorageError::new(e.to_string()))?;
        let priority: JobPriority = row
            .text("priority")?
            .parse()
            .map_err(|e: Error| StorageError::new(e.to_string()))?;
        let callable_type: CallableKind = row
            .text("callable_type")?
            .parse()
            .map_err(|e: Error| StorageError::new(e.to_string()))?;

        Ok(Job {
            id: row.int("id")?,
            uuid: row.text("uuid")?,
            name: row.text("name")?,
            callable_type,
            callable: row.text("callable")?,
            namespace: row.opt_text("namespace")?,
            object_instance: row.opt_text("object_instance")?,
            path_files: row.opt_text("path_files")?,
            params: row.text("params")?,
            status,
            priority,
            pid: row.opt_text("pid")?,
            timeout: row.int("timeout")?,
            retry_count: row.int("retry_count")?,
            max_retries: row.int("max_retries")?,
            retry_delay: row.int("retry_delay")?,
            started_at: row.opt_timestamp("started_at")?,
            completed_at: row.opt_timestamp("completed_at")?,
            created_at: row.timestamp("created_at")?,
            updated_at: row.opt_timestamp("updated_at")?,
        })
    }

    /// JSON snapshot of the row, stored in `failed_jobs.payload` on terminal failure.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::Value::Null)
    }
}

/// Forensic record written when a job fails terminally.
#[derive(Debug, Clone, Serialize)]
pub struct FailedJob {
    /// Surrogate primary key.
    pub id: i64,
    /// Mirror of the job's uuid.
    pub uuid: String,
    /// Foreign key to `jobs.id`, on-delete cascade.
    pub job_id: i64,
    /// Error message plus trace context.
    pub exception: String,
    /// Encoded snapshot of the job row at failure.
    pub payload: String,
    /// When the terminal failure was recorded.
    pub failed_at: DateTime<Utc>,
}

impl FailedJob {
    /// Build a `FailedJob` from a neutral storage row.
    pub fn from_row(row: &SqlRow) -> Result<Self, StorageError> {
        Ok(FailedJob {
            id: row.int("id")?,
            uuid: row.text("uuid")?,
            job_id: row.int("job_id")?,
            exception: row.text("exception")?,
            payload: row.text("payload")?,
            failed_at: row.timestamp("failed_at")?,
        })
    }
}

/// Aggregate counters returned by the stats query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStats {
    /// All rows in the jobs table.
    pub total: i64,
    /// Rows with status `pending`.
    pub pending: i64,
    /// Rows with status `processing`.
    pub processing: i64,
    /// Rows with status `completed`.
    pub completed: i64,
    /// Rows with status `failed`.
    pub failed: i64,
    /// Mean seconds between `created_at` and `completed_at` over completed jobs.
    pub avg_completion_seconds: Option<f64>,
}
