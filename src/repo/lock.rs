//! Two-level mutual exclusion over a repository's main checkout.
//!
//! The guard composes an in-process async mutex (serializes tasks inside one
//! server instance, FIFO) with a cross-process advisory file lock stored in
//! the repository's `.git` directory (serializes independent processes
//! sharing the same filesystem). Neither layer alone is sufficient: advisory
//! locks are process-scoped, and an in-memory mutex cannot see other
//! processes. Callers only ever see the composed guard.
//!
//! Acquisition blocks until both layers are held; there is no timeout. A
//! wedged holder therefore blocks all later operations on that repository —
//! a documented limitation of the current design.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::{Mutex, OwnedMutexGuard};

const LOCK_FILE_NAME: &str = "codemedic.lock";

/// Keyed lock table. One entry per distinct repository path ever locked,
/// created lazily and kept for the lifetime of the manager.
#[derive(Default)]
pub struct RepoLockManager {
    table: StdMutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

/// Scoped ownership of one repository. Dropping the guard releases the file
/// lock first, then the in-process mutex.
pub struct RepoLockGuard {
    file: Option<File>,
    lock_path: PathBuf,
    _mutex: OwnedMutexGuard<()>,
}

impl Drop for RepoLockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take()
            && let Err(e) = fs2::FileExt::unlock(&file)
        {
            tracing::warn!(
                "failed to release lock file {}: {e}",
                self.lock_path.display()
            );
        }
        // the in-process mutex guard drops after the file lock is gone
    }
}

impl RepoLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire exclusive ownership of `repo`. Blocks until both the
    /// in-process mutex and the advisory file lock are held.
    pub async fn acquire(&self, repo: &Path) -> Result<RepoLockGuard> {
        let key = repo.canonicalize().unwrap_or_else(|_| repo.to_path_buf());
        let mutex = {
            let mut table = self.table.lock().expect("lock table poisoned");
            Arc::clone(table.entry(key).or_default())
        };
        let mutex_guard = mutex.lock_owned().await;

        let lock_path = repo.join(".git").join(LOCK_FILE_NAME);
        let file = {
            let open_path = lock_path.clone();
            tokio::task::spawn_blocking(move || -> std::io::Result<File> {
                let file = OpenOptions::new()
                    .create(true)
                    .read(true)
                    .write(true)
                    .open(&open_path)?;
                fs2::FileExt::lock_exclusive(&file)?;
                Ok(file)
            })
            .await
            .context("lock acquisition task panicked")?
            .with_context(|| format!("Failed to lock {}", lock_path.display()))?
        };

        Ok(RepoLockGuard {
            file: Some(file),
            lock_path,
            _mutex: mutex_guard,
        })
    }
}
