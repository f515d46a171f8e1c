//! In-memory observability and cancellation registries.
//!
//! `JobRegistry` answers "what is running right now" — it holds only
//! in-flight operations, never history, and enforces nothing (exclusivity is
//! the repo lock's job). `ProcessTable` maps a job id to the external
//! fixing-agent process so a specific job can be cancelled.
//!
//! Both are plain injectable structs owning their own synchronization so
//! tests can instantiate isolated instances.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Grace period between asking a process to terminate and force-killing it.
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Sync,
    Commit,
    Push,
    CommitPush,
    CommitPushPr,
    Fix,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Sync => "sync",
            JobKind::Commit => "commit",
            JobKind::Push => "push",
            JobKind::CommitPush => "commit_push",
            JobKind::CommitPushPr => "commit_push_pr",
            JobKind::Fix => "fix",
        }
    }
}

/// A currently in-flight operation against a repository.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub repo_path: PathBuf,
    pub kind: JobKind,
    pub status: &'static str,
    pub created_at: DateTime<Utc>,
    pub details: String,
}

type JobMap = Arc<StdMutex<HashMap<String, Job>>>;

#[derive(Default, Clone)]
pub struct JobRegistry {
    jobs: JobMap,
}

/// Scoped registration: the job record is removed when the ticket drops,
/// so no exit path can leave a stale entry behind.
pub struct JobTicket {
    jobs: JobMap,
    id: String,
}

impl JobTicket {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for JobTicket {
    fn drop(&mut self) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.remove(&self.id);
        }
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new job under a generated id.
    pub fn begin(&self, repo: &Path, kind: JobKind, details: &str) -> JobTicket {
        self.begin_with_id(Uuid::new_v4().to_string(), repo, kind, details)
    }

    /// Register a new job under a caller-supplied id (fix jobs, whose id the
    /// caller needs for cancellation).
    pub fn begin_with_id(
        &self,
        id: String,
        repo: &Path,
        kind: JobKind,
        details: &str,
    ) -> JobTicket {
        let job = Job {
            id: id.clone(),
            repo_path: repo.to_path_buf(),
            kind,
            status: "running",
            created_at: Utc::now(),
            details: details.to_string(),
        };
        self.jobs
            .lock()
            .expect("job registry poisoned")
            .insert(id.clone(), job);
        JobTicket {
            jobs: Arc::clone(&self.jobs),
            id,
        }
    }

    /// Current membership, optionally filtered by repository path. No
    /// ordering guarantee.
    pub fn snapshot(&self, repo: Option<&Path>) -> Vec<Job> {
        let jobs = self.jobs.lock().expect("job registry poisoned");
        jobs.values()
            .filter(|job| repo.is_none_or(|r| job.repo_path == r))
            .cloned()
            .collect()
    }
}

#[derive(Default, Clone)]
pub struct ProcessTable {
    procs: Arc<Mutex<HashMap<String, Child>>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, job_id: &str, child: Child) {
        self.procs.lock().await.insert(job_id.to_string(), child);
    }

    /// Take ownership of the process handle back out of the table, typically
    /// to reap it after its output streams closed. Returns `None` when the
    /// job is unknown or was already taken by `cancel`.
    pub async fn take(&self, job_id: &str) -> Option<Child> {
        self.procs.lock().await.remove(job_id)
    }

    /// Drop a registration without touching the process.
    pub async fn unregister(&self, job_id: &str) {
        self.procs.lock().await.remove(job_id);
    }

    /// Cancel the job's process: request graceful termination, wait out the
    /// grace period, then force-kill. Returns whether a running process was
    /// found and acted on.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let Some(mut child) = self.take(job_id).await else {
            return false;
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
        #[cfg(not(unix))]
        let _ = child.start_kill();

        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
            tracing::warn!("job {job_id} ignored termination request, force-killing");
            let _ = child.kill().await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    #[test]
    fn test_begin_and_snapshot() {
        let registry = JobRegistry::new();
        let ticket = registry.begin(Path::new("/tmp/repo-a"), JobKind::Sync, "aligning");
        let jobs = registry.snapshot(None);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, ticket.id());
        assert_eq!(jobs[0].kind, JobKind::Sync);
        assert_eq!(jobs[0].status, "running");
    }

    #[test]
    fn test_ticket_drop_removes_job() {
        let registry = JobRegistry::new();
        {
            let _ticket = registry.begin(Path::new("/tmp/repo-a"), JobKind::Commit, "c");
            assert_eq!(registry.snapshot(None).len(), 1);
        }
        assert!(registry.snapshot(None).is_empty());
    }

    #[test]
    fn test_snapshot_filters_by_repo() {
        let registry = JobRegistry::new();
        let _a = registry.begin(Path::new("/tmp/repo-a"), JobKind::Push, "a");
        let _b = registry.begin(Path::new("/tmp/repo-b"), JobKind::Fix, "b");
        let only_a = registry.snapshot(Some(Path::new("/tmp/repo-a")));
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].repo_path, Path::new("/tmp/repo-a"));
    }

    #[test]
    fn test_begin_with_id_uses_caller_id() {
        let registry = JobRegistry::new();
        let ticket =
            registry.begin_with_id("job-42".to_string(), Path::new("/r"), JobKind::Fix, "f");
        assert_eq!(ticket.id(), "job-42");
        assert_eq!(registry.snapshot(None)[0].id, "job-42");
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_returns_false() {
        let table = ProcessTable::new();
        assert!(!table.cancel("no-such-job").await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_terminates_running_process() {
        let table = ProcessTable::new();
        let child = Command::new("sleep")
            .arg("60")
            .spawn()
            .expect("spawn sleep");
        table.register("job-1", child).await;

        let start = std::time::Instant::now();
        assert!(table.cancel("job-1").await);
        // sleep honors SIGTERM, so this must beat the force-kill grace period
        assert!(start.elapsed() < KILL_GRACE);
        // a second cancel finds nothing
        assert!(!table.cancel("job-1").await);
    }

    #[tokio::test]
    async fn test_take_removes_handle() {
        let table = ProcessTable::new();
        let child = Command::new("sleep").arg("0").spawn().expect("spawn");
        table.register("job-2", child).await;
        assert!(table.take("job-2").await.is_some());
        assert!(table.take("job-2").await.is_none());
    }
}
