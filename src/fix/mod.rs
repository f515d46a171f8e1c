//! End-to-end fix orchestration.
//!
//! A fix run isolates itself in a worktree, drives the external fixing agent
//! there, commits and pushes the result from the worktree, then adopts the
//! new branch into the main checkout under the repo lock. The worktree
//! commit/push deliberately run unguarded: they touch a disposable checkout,
//! so concurrent fixes against the same repository never contend until the
//! brief branch-adoption section at the end.
//!
//! Callers consume a lazy event sequence: zero or more `Log` lines as the
//! agent produces them, then exactly one `Completed`, always last. Every
//! failure arrives as a `Completed { success: false, .. }` event with a
//! displayable reason; the caller never observes a raw fault.

use crate::config::AgentConfig;
use crate::errors::GitError;
use crate::git;
use crate::jobs::{JobKind, JobRegistry, ProcessTable};
use crate::repo::{RepoLockManager, worktree};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One element of a fix run's output sequence.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FixEvent {
    Log {
        line: String,
    },
    Completed {
        success: bool,
        message: String,
        branch_name: Option<String>,
    },
}

/// Drives the fix state machine. Cloneable; all state lives in the injected
/// services.
#[derive(Clone)]
pub struct FixOrchestrator {
    agent: AgentConfig,
    primary_branch: String,
    locks: Arc<RepoLockManager>,
    jobs: JobRegistry,
    procs: ProcessTable,
}

impl FixOrchestrator {
    pub fn new(
        agent: AgentConfig,
        primary_branch: impl Into<String>,
        locks: Arc<RepoLockManager>,
        jobs: JobRegistry,
        procs: ProcessTable,
    ) -> Self {
        Self {
            agent,
            primary_branch: primary_branch.into(),
            locks,
            jobs,
            procs,
        }
    }

    /// Start a fix run. Returns the receiving end of the event sequence;
    /// the run itself proceeds on a background task until its terminal
    /// `Completed` event, regardless of whether the receiver is still
    /// listening.
    pub fn run_fix(
        &self,
        repo: PathBuf,
        trace: String,
        job_id: String,
        model: Option<String>,
    ) -> mpsc::Receiver<FixEvent> {
        let (tx, rx) = mpsc::channel(64);
        let this = self.clone();

        tokio::spawn(async move {
            let _ticket = this.jobs.begin_with_id(
                job_id.clone(),
                &repo,
                JobKind::Fix,
                "running fixing agent",
            );

            let mut live_worktree: Option<PathBuf> = None;
            let outcome = this
                .drive(&repo, &trace, &job_id, model.as_deref(), &tx, &mut live_worktree)
                .await;

            // unconditional cleanup, never part of the happy path
            if let Some(wt) = live_worktree.take() {
                worktree::destroy(&repo, &wt).await;
            }
            this.procs.unregister(&job_id).await;

            let terminal = outcome.unwrap_or_else(|e| {
                tracing::error!("fix {job_id} hit an unexpected fault: {e:#}");
                FixEvent::Completed {
                    success: false,
                    message: format!("Fix failed: {e:#}"),
                    branch_name: None,
                }
            });
            let _ = tx.send(terminal).await;
        });

        rx
    }

    /// Cancel a running fix by terminating its registered agent process.
    /// Returns false for unknown job ids.
    pub async fn cancel(&self, job_id: &str) -> bool {
        self.procs.cancel(job_id).await
    }

    /// The state machine proper. Expected failures come back as
    /// `Ok(Completed { success: false, .. })`; only unexpected faults use
    /// `Err`, and the caller converts those into the same shape.
    ///
    /// `live_worktree` tracks the worktree for the caller's unconditional
    /// teardown; it is cleared once the flow destroys the worktree itself.
    async fn drive(
        &self,
        repo: &Path,
        trace: &str,
        job_id: &str,
        model: Option<&str>,
        tx: &mpsc::Sender<FixEvent>,
        live_worktree: &mut Option<PathBuf>,
    ) -> Result<FixEvent> {
        let branch = fix_branch_name();

        let wt = match worktree::create(repo, &branch, &self.primary_branch).await {
            Ok(path) => path,
            Err(e) => return Ok(failed(format!("Failed to create isolated worktree: {e:#}"))),
        };
        *live_worktree = Some(wt.clone());

        // launch the agent rooted at the worktree
        let prompt = format!(
            "Analyze the repository at {}. I have found the following error log:\n\n{}\n\n\
             Locate the code responsible for this error and apply a fix directly to the file(s). \
             Do not ask for confirmation, just apply the code changes.",
            repo.display(),
            trace
        );
        let mut cmd = Command::new(&self.agent.cmd);
        cmd.args(&self.agent.args);
        if let Some(model) = model.or(self.agent.model.as_deref()) {
            cmd.args(["--model", model]);
        }
        cmd.arg(&prompt)
            .current_dir(&wt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Ok(failed(format!(
                    "Failed to launch fixing agent '{}': {e}",
                    self.agent.cmd
                )));
            }
        };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        self.procs.register(job_id, child).await;

        // stream the combined output line by line while collecting it
        let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
        if let Some(stdout) = stdout {
            tokio::spawn(forward_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(forward_lines(stderr, line_tx.clone()));
        }
        drop(line_tx);

        let mut output_lines: Vec<String> = Vec::new();
        while let Some(line) = line_rx.recv().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            output_lines.push(line.to_string());
            let _ = tx
                .send(FixEvent::Log {
                    line: line.to_string(),
                })
                .await;
        }

        // reap the process; a missing handle means cancel() already took it
        let Some(mut child) = self.procs.take(job_id).await else {
            return Ok(failed("Fix was cancelled before completion.".to_string()));
        };
        let status = child.wait().await.context("Failed to wait for fixing agent")?;
        let combined = output_lines.join("\n");

        if !status.success() {
            let code = status.code().map_or("signal".to_string(), |c| c.to_string());
            return Ok(failed(format!(
                "Fixing agent failed (exit {code}):\n{combined}"
            )));
        }
        if combined.trim().is_empty() {
            return Ok(FixEvent::Completed {
                success: true,
                message: "Fixing agent completed with exit 0 but returned NO output.".to_string(),
                branch_name: None,
            });
        }

        // commit and push from the worktree; no repo lock needed here
        match git::stage_with_denylist(&wt).await {
            Ok(()) => {}
            Err(GitError::NothingToCommit) => {
                return Ok(failed(
                    "Fixing agent completed successfully, but no file changes were detected \
                     to commit. It might have failed to find the code."
                        .to_string(),
                ));
            }
            Err(GitError::OnlyIgnoredChanges) => {
                return Ok(failed(
                    "Fixing agent completed successfully, but only ignored IDE artifacts were \
                     changed; nothing to commit."
                        .to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        }

        let subject = format!("Fix: {}", trace.lines().next().unwrap_or("automated fix").trim());
        git::commit_staged(&wt, &subject).await?;
        git::push_upstream(&wt).await?;

        // the branch cannot be checked out in the main checkout while the
        // worktree still holds it
        worktree::destroy(repo, &wt).await;
        *live_worktree = None;

        // adopt the branch into the main checkout under the repo lock
        {
            let _lock = self.locks.acquire(repo).await?;
            git::git(repo, &["fetch", "origin", &branch]).await?;
            git::stash_if_dirty(repo, "codemedic fix adoption").await?;
            let remote_ref = format!("origin/{branch}");
            git::git(repo, &["checkout", "--track", "-B", &branch, &remote_ref]).await?;
        }

        Ok(FixEvent::Completed {
            success: true,
            message: format!("Success! Fix committed and pushed to branch: {branch}"),
            branch_name: Some(branch),
        })
    }
}

fn failed(message: String) -> FixEvent {
    FixEvent::Completed {
        success: false,
        message,
        branch_name: None,
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

/// Unique branch name for a fix: unix timestamp plus a random 4-digit
/// suffix, so concurrent submissions never need to coordinate.
fn fix_branch_name() -> String {
    let ts = chrono::Utc::now().timestamp();
    let suffix = (Uuid::new_v4().as_u128() % 10_000) as u32;
    format!("fix/error-{ts}-{suffix:04}")
}

/// Models the fixing agent advertises: distinct non-empty lines of
/// `<agent> models` that do not start with a digit. A missing or failing
/// agent CLI yields an empty list, never an error.
pub async fn list_models(agent_cmd: &str) -> Vec<String> {
    let output = match Command::new(agent_cmd).arg("models").output().await {
        Ok(output) if output.status.success() => output,
        _ => return Vec::new(),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut seen = HashSet::new();
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(|c: char| c.is_ascii_digit()))
        .filter(|line| seen.insert(line.to_string()))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn run(dir: &Path, args: &[&str]) -> String {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn repo_with_remote() -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let remote = dir.path().join("remote.git");
        let work = dir.path().join("work");
        std::fs::create_dir(&remote).unwrap();
        run(&remote, &["init", "--bare", "-b", "master"]);
        run(dir.path(), &[
            "clone",
            remote.to_str().unwrap(),
            work.to_str().unwrap(),
        ]);
        std::fs::write(work.join("README.md"), "hello\n").unwrap();
        run(&work, &["add", "-A"]);
        run(&work, &[
            "-c",
            "user.name=test",
            "-c",
            "user.email=test@test",
            "commit",
            "-m",
            "init",
        ]);
        run(&work, &["push", "-u", "origin", "master"]);
        (dir, work)
    }

    /// Orchestrator whose "agent" is a shell script. The prompt lands in $0,
    /// which the scripts ignore.
    fn orchestrator(script: &str) -> FixOrchestrator {
        FixOrchestrator::new(
            AgentConfig {
                cmd: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                model: None,
            },
            "master",
            Arc::new(RepoLockManager::new()),
            JobRegistry::new(),
            ProcessTable::new(),
        )
    }

    async fn collect(mut rx: mpsc::Receiver<FixEvent>) -> Vec<FixEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn terminal(events: &[FixEvent]) -> (bool, &str, Option<&str>) {
        // the terminal event must be exactly one Completed, and last
        let completed: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, FixEvent::Completed { .. }))
            .collect();
        assert_eq!(completed.len(), 1, "expected exactly one Completed event");
        match events.last().unwrap() {
            FixEvent::Completed {
                success,
                message,
                branch_name,
            } => (*success, message.as_str(), branch_name.as_deref()),
            FixEvent::Log { .. } => panic!("Completed must be the last event"),
        }
    }

    fn worktree_count(repo: &Path) -> usize {
        run(repo, &["worktree", "list", "--porcelain"])
            .lines()
            .filter(|line| line.starts_with("worktree "))
            .count()
    }

    #[test]
    fn test_fix_branch_name_format() {
        let name = fix_branch_name();
        let rest = name.strip_prefix("fix/error-").unwrap();
        let (ts, suffix) = rest.split_once('-').unwrap();
        assert!(ts.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(suffix.len(), 4);
        assert!(suffix.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn test_successful_fix_pushes_and_adopts_branch() {
        let (_dir, work) = repo_with_remote();
        let orch = orchestrator("echo analyzing; echo patched > fix.txt; echo done");

        let rx = orch.run_fix(
            work.clone(),
            "NullPointerException in OrderService".to_string(),
            "job-ok".to_string(),
            None,
        );
        let events = collect(rx).await;

        let logs: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                FixEvent::Log { line } => Some(line.as_str()),
                _ => None,
            })
            .collect();
        assert!(logs.contains(&"analyzing"));
        assert!(logs.contains(&"done"));

        let (success, message, branch) = terminal(&events);
        assert!(success, "unexpected failure: {message}");
        let branch = branch.expect("success must carry the branch name");
        assert!(branch.starts_with("fix/error-"));
        assert!(message.contains(branch));

        // the branch is now checked out in the main checkout, with the fix
        assert_eq!(run(&work, &["rev-parse", "--abbrev-ref", "HEAD"]), branch);
        assert!(work.join("fix.txt").exists());
        let subject = run(&work, &["log", "-1", "--format=%s"]);
        assert_eq!(subject, "Fix: NullPointerException in OrderService");

        // worktree gone, nothing left behind
        assert_eq!(worktree_count(&work), 1);
    }

    #[tokio::test]
    async fn test_agent_with_no_output_succeeds_without_committing() {
        let (_dir, work) = repo_with_remote();
        let orch = orchestrator("exit 0");

        let events = collect(orch.run_fix(
            work.clone(),
            "trace".to_string(),
            "job-silent".to_string(),
            None,
        ))
        .await;

        let (success, message, branch) = terminal(&events);
        assert!(success);
        assert!(message.contains("NO output"));
        assert!(branch.is_none());
        // still on the primary branch, worktree torn down
        assert_eq!(run(&work, &["rev-parse", "--abbrev-ref", "HEAD"]), "master");
        assert_eq!(worktree_count(&work), 1);
    }

    #[tokio::test]
    async fn test_agent_failure_reports_exit_and_output() {
        let (_dir, work) = repo_with_remote();
        let orch = orchestrator("echo boom; exit 3");

        let events = collect(orch.run_fix(
            work.clone(),
            "trace".to_string(),
            "job-fail".to_string(),
            None,
        ))
        .await;

        let (success, message, _) = terminal(&events);
        assert!(!success);
        assert!(message.contains("exit 3"));
        assert!(message.contains("boom"));
        assert_eq!(worktree_count(&work), 1);
    }

    #[tokio::test]
    async fn test_agent_touching_nothing_reports_no_changes() {
        let (_dir, work) = repo_with_remote();
        let orch = orchestrator("echo looked around, changed nothing");

        let events = collect(orch.run_fix(
            work.clone(),
            "trace".to_string(),
            "job-noop".to_string(),
            None,
        ))
        .await;

        let (success, message, _) = terminal(&events);
        assert!(!success);
        assert!(message.contains("no file changes were detected to commit"));
        assert_eq!(worktree_count(&work), 1);
    }

    #[tokio::test]
    async fn test_agent_touching_only_denylisted_files_is_a_distinct_no_op() {
        let (_dir, work) = repo_with_remote();
        let orch = orchestrator("echo ide noise > .classpath; echo wrote settings");

        let events = collect(orch.run_fix(
            work.clone(),
            "trace".to_string(),
            "job-ide".to_string(),
            None,
        ))
        .await;

        let (success, message, _) = terminal(&events);
        assert!(!success);
        assert!(message.contains("IDE artifacts"));
        assert!(message.contains("nothing to commit"));
        assert_eq!(worktree_count(&work), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_terminates_a_running_fix() {
        let (_dir, work) = repo_with_remote();
        let orch = orchestrator("sleep 60");

        let rx = orch.run_fix(
            work.clone(),
            "trace".to_string(),
            "job-cancel".to_string(),
            None,
        );

        // the agent registers shortly after worktree setup; poll until then
        let mut cancelled = false;
        for _ in 0..100 {
            if orch.cancel("job-cancel").await {
                cancelled = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        assert!(cancelled, "never found a process to cancel");

        let events = collect(rx).await;
        let (success, message, _) = terminal(&events);
        assert!(!success);
        assert!(message.contains("cancelled"));
        assert_eq!(worktree_count(&work), 1);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_is_not_found() {
        let orch = orchestrator("true");
        assert!(!orch.cancel("no-such-job").await);
    }

    #[tokio::test]
    async fn test_list_models_with_missing_agent_is_empty() {
        assert!(list_models("definitely-not-a-real-binary-7f3a").await.is_empty());
    }

    #[tokio::test]
    async fn test_list_models_filters_and_dedupes() {
        // stub agent that advertises duplicates, blanks and a version line
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("agent");
        std::fs::write(
            &script,
            "#!/bin/sh\nprintf 'anthropic/claude\\n\\n1.2.3\\nanthropic/claude\\nopenai/gpt\\n'\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let models = list_models(script.to_str().unwrap()).await;
        assert_eq!(models, vec!["anthropic/claude", "openai/gpt"]);
    }
}
