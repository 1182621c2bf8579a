//! Queue and worker configuration, serialized to the worker as JSON.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Name of the lock file created under [`QueueConfig::lock_dir`].
pub const LOCK_FILE_NAME: &str = "queue_worker.lock";

fn default_process_check_interval_us() -> u64 {
    1_000_000
}

fn default_worker_timeout_s() -> u64 {
    3_600
}

fn default_max_workers() -> u32 {
    1
}

fn default_lock_dir() -> PathBuf {
    std::env::temp_dir()
}

/// Configuration shared by producers and the worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Microseconds to sleep between empty polls.
    #[serde(default = "default_process_check_interval_us")]
    pub process_check_interval_us: u64,
    /// Total worker lifetime in seconds; the worker exits cleanly when
    /// reached and the next dispatch respawns it.
    #[serde(default = "default_worker_timeout_s")]
    pub worker_timeout_s: u64,
    /// Reserved. Values above 1 are advisory; actual concurrency is 1.
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,
    /// Directory holding the worker lock file.
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
    /// Process-stable secret for the closure integrity tag. Producers and
    /// workers must agree on it; leave unset only when closure jobs are
    /// never dispatched.
    #[serde(default)]
    pub secret_key: Option<String>,
    /// Worker binary to spawn. Defaults to `dispatchq-worker` next to the
    /// current executable, falling back to `PATH` lookup.
    #[serde(default)]
    pub worker_binary: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            process_check_interval_us: default_process_check_interval_us(),
            worker_timeout_s: default_worker_timeout_s(),
            max_workers: default_max_workers(),
            lock_dir: default_lock_dir(),
            secret_key: None,
            worker_binary: None,
        }
    }
}

impl QueueConfig {
    /// Sleep between empty polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.process_check_interval_us)
    }

    /// Total worker lifetime.
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_s)
    }

    /// Path of the worker lock file.
    pub fn lock_file(&self) -> PathBuf {
        self.lock_dir.join(LOCK_FILE_NAME)
    }

    /// Concurrency actually used. Anything above 1 is advisory.
    pub fn effective_workers(&self) -> u32 {
        if self.max_workers > 1 {
            warn!(
                max_workers = self.max_workers,
                "max_workers > 1 is advisory; this build runs a single worker"
            );
        }
        1
    }

    /// Key bytes for the closure integrity tag.
    pub fn secret(&self) -> Vec<u8> {
        self.secret_key
            .as_deref()
            .map(|s| s.as_bytes().to_vec())
            .unwrap_or_default()
    }
}
