//! Advisory file lock enforcing at most one worker process touches the GPU at a time.
//!
//! The watchdog is the sole spawner of worker processes and is the primary line of defense
//! against two workers running concurrently; this lock is the second line of defense against a
//! zombie worker process the watchdog failed to kill.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock file io error: {0}")]
    Io(#[from] io::Error),
    #[error("lock already held by pid {0}")]
    Held(i32),
}

pub struct WorkerLock {
    path: PathBuf,
}

impl WorkerLock {
    /// Attempts to acquire the lock at `path`. If a lock file already exists and names a PID
    /// that is still alive, returns `LockError::Held`. If the named PID is dead, the lock file
    /// is considered stale and is replaced.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();

        if let Some(existing_pid) = read_pid(&path)? {
            if pid_is_alive(existing_pid) {
                return Err(LockError::Held(existing_pid));
            }
        }

        std::fs::write(&path, std::process::id().to_string())?;
        Ok(Self { path })
    }
}

impl Drop for WorkerLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn read_pid(path: &Path) -> Result<Option<i32>, io::Error> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents.trim().parse().ok()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// True if `pid` names a running process, checked via `/proc/{pid}` on Linux.
pub fn pid_is_alive(pid: i32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_lock_when_no_file_present() {
        let path = std::env::temp_dir().join(format!("batchctl-lock-test-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let lock = WorkerLock::acquire(&path).unwrap();
        assert!(path.exists());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn rejects_when_pid_in_file_is_alive() {
        let path =
            std::env::temp_dir().join(format!("batchctl-lock-held-test-{}", std::process::id()));
        std::fs::write(&path, std::process::id().to_string()).unwrap();

        let result = WorkerLock::acquire(&path);
        assert!(matches!(result, Err(LockError::Held(_))));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn replaces_stale_lock_from_dead_pid() {
        let path =
            std::env::temp_dir().join(format!("batchctl-lock-stale-test-{}", std::process::id()));
        // pid 0 never names a live /proc entry for an unprivileged process.
        std::fs::write(&path, "999999999").unwrap();

        let lock = WorkerLock::acquire(&path).unwrap();
        drop(lock);
        assert!(!path.exists());
    }
}
