//! Single-worker enforcement and autonomous worker spawning.
//!
//! A lock file under the configured directory holds the owning worker's pid
//! as plain ASCII. Producers probe it on every dispatch: a live pid means a
//! worker is draining the queue, a stale one is collected and a fresh worker
//! is spawned as a detached process.

use crate::config::QueueConfig;
use crate::errors::{Error, Result};
use crate::storage::DriverConfig;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Manages the worker lock file and process lifecycle.
#[derive(Debug, Clone)]
pub struct WorkerSupervisor {
    config: QueueConfig,
}

impl WorkerSupervisor {
    /// Build a supervisor over the shared queue configuration.
    pub fn new(config: QueueConfig) -> Self {
        Self { config }
    }

    /// Path of the lock file.
    pub fn lock_file(&self) -> PathBuf {
        self.config.lock_file()
    }

    /// Make sure a worker process is draining the queue.
    ///
    /// Returns `true` when a new worker was spawned, `false` when a live one
    /// already holds the lock. Idempotent under a live worker.
    pub async fn ensure_worker_running(&self, driver_config: &DriverConfig) -> Result<bool> {
        if let Some(pid) = self.read_locked_pid() {
            if pid_alive(pid) {
                debug!(pid, "Worker already running");
                return Ok(false);
            }
            info!(pid, "Collecting stale worker lock");
            if let Err(error) = std::fs::remove_file(self.lock_file()) {
                warn!(%error, "Failed to remove stale lock file");
            }
        }

        self.spawn_worker(driver_config).await?;
        Ok(true)
    }

    /// Write the current process id into the lock file, mode 0644.
    ///
    /// Called by the worker at startup; failure means another worker owns
    /// the file or the directory is unwritable.
    pub fn acquire_lock(&self) -> Result<()> {
        let path = self.lock_file();
        let pid = std::process::id();
        std::fs::write(&path, format!("{pid}\n"))
            .map_err(|e| Error::LockContention(format!("{}: {e}", path.display())))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o644);
            if let Err(error) = std::fs::set_permissions(&path, perms) {
                warn!(%error, "Failed to set lock file permissions");
            }
        }

        debug!(pid, path = %path.display(), "Acquired worker lock");
        Ok(())
    }

    /// Delete the lock file. Invoked from the worker's shutdown path.
    pub fn release_lock(&self) {
        let path = self.lock_file();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Released worker lock"),
            Err(error) => warn!(%error, "Failed to remove lock file"),
        }
    }

    /// The pid recorded in the lock file, if any.
    pub fn read_locked_pid(&self) -> Option<u32> {
        let contents = std::fs::read_to_string(self.lock_file()).ok()?;
        contents.trim().parse().ok()
    }

    async fn spawn_worker(&self, driver_config: &DriverConfig) -> Result<()> {
        let driver_json = serde_json::to_string(driver_config)
            .map_err(|e| Error::DispatchFailed(format!("driver config serialization: {e}")))?;
        let config_json = serde_json::to_string(&self.config)
            .map_err(|e| Error::DispatchFailed(format!("worker config serialization: {e}")))?;

        let binary = self.worker_binary();
        info!(binary = %binary.display(), "Spawning queue worker");

        // Configuration travels as structured argv, never through a shell.
        // The child is detached: streams are discarded and the handle is
        // dropped without waiting.
        Command::new(&binary)
            .arg(format!("--driver-config={driver_json}"))
            .arg(format!("--config={config_json}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                Error::DispatchFailed(format!("failed to spawn {}: {e}", binary.display()))
            })?;

        Ok(())
    }

    fn worker_binary(&self) -> PathBuf {
        if let Some(binary) = &self.config.worker_binary {
            return binary.clone();
        }
        let name = if cfg!(windows) {
            "dispatchq-worker.exe"
        } else {
            "dispatchq-worker"
        };
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                let sibling = dir.join(name);
                if sibling.exists() {
                    return sibling;
                }
            }
        }
        PathBuf::from(name)
    }
}

/// Whether a process with the given pid is alive.
#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

/// Whether a process with the given pid is alive (kill-0 probe).
#[cfg(all(unix, not(target_os = "linux")))]
fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Whether a process with the given pid is alive (tasklist scan, best effort).
#[cfg(windows)]
fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_none, assert_some_eq};
    use tempfile::TempDir;

    fn supervisor(dir: &TempDir) -> WorkerSupervisor {
        WorkerSupervisor::new(QueueConfig {
            lock_dir: dir.path().to_path_buf(),
            ..QueueConfig::default()
        })
    }

    #[test]
    fn lock_file_holds_our_pid_as_ascii() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir);

        supervisor.acquire_lock().unwrap();
        assert_some_eq!(supervisor.read_locked_pid(), std::process::id());

        let contents = std::fs::read_to_string(supervisor.lock_file()).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());

        supervisor.release_lock();
        assert_none!(supervisor.read_locked_pid());
    }

    #[cfg(unix)]
    #[test]
    fn lock_file_mode_is_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir);
        supervisor.acquire_lock().unwrap();

        let mode = std::fs::metadata(supervisor.lock_file())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn unreadable_lock_reports_no_pid() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir);
        assert_none!(supervisor.read_locked_pid());

        std::fs::write(supervisor.lock_file(), "not a pid").unwrap();
        assert_none!(supervisor.read_locked_pid());
    }

    #[tokio::test]
    async fn live_worker_short_circuits_the_spawn() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir);

        // Our own pid is certainly alive.
        supervisor.acquire_lock().unwrap();
        let spawned = supervisor
            .ensure_worker_running(&DriverConfig::sqlite("sqlite::memory:"))
            .await
            .unwrap();
        assert!(!spawned);
    }

    #[tokio::test]
    async fn stale_lock_is_collected_and_a_worker_spawned() {
        let dir = TempDir::new().unwrap();
        let mut config = QueueConfig {
            lock_dir: dir.path().to_path_buf(),
            ..QueueConfig::default()
        };
        // Spawn something trivial instead of a real worker.
        config.worker_binary = Some(PathBuf::from("true"));
        let supervisor = WorkerSupervisor::new(config);

        // A pid far above pid_max on typical hosts.
        std::fs::write(supervisor.lock_file(), "999999999\n").unwrap();

        let spawned = supervisor
            .ensure_worker_running(&DriverConfig::sqlite("sqlite::memory:"))
            .await
            .unwrap();
        assert!(spawned);
        // The stale entry was collected before spawning.
        assert_none!(supervisor.read_locked_pid());
    }
}
