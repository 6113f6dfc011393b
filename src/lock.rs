//! Task-level run lock.
//!
//! No two pipeline runs may be active for the same task id: the execution
//! context is single-writer by contract. The lock is an exclusive flock on
//! a per-task file, released on drop (or by the OS if the process dies).

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;

use crate::errors::ConductorError;

pub struct TaskLock {
    file: File,
    path: PathBuf,
}

impl TaskLock {
    /// Try to acquire the run lock for `task_id`. Fails immediately if
    /// another run holds it.
    pub fn acquire(lock_dir: &Path, task_id: &str) -> Result<Self> {
        std::fs::create_dir_all(lock_dir).context("Failed to create lock directory")?;
        let path = lock_dir.join(format!("{task_id}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .context("Failed to open lock file")?;

        file.try_lock_exclusive().map_err(|_| {
            ConductorError::LockHeld(format!(
                "task {task_id} already has an active pipeline run"
            ))
        })?;

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TaskLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
