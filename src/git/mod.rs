//! Subprocess git pipeline over a repository checkout.
//!
//! Every git invocation is a discrete subprocess call with a fixed argument
//! vector and the target checkout as its working directory; a non-zero exit
//! surfaces the trimmed stderr as the failure reason. The free functions at
//! the top operate on any checkout (the fix flow uses them against a
//! disposable worktree, where no locking is needed). `GitOps` wraps them into
//! the lock-protected, job-registered operations on the main checkout.

use crate::errors::GitError;
use crate::jobs::{JobKind, JobRegistry};
use crate::repo::RepoLockManager;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;

/// IDE/editor artifacts that must never be committed, matched by exact name
/// or path component against the staged file list.
pub const IDE_DENYLIST: &[&str] = &[".classpath", ".project", ".factorypath"];

/// Commit identity for every bot-made commit.
const BOT_NAME: &str = "codemedic";
const BOT_EMAIL: &str = "codemedic@localhost";

/// Commit subjects are cut to the first line and this many characters.
const COMMIT_SUBJECT_MAX: usize = 100;

/// Run one git command in `dir`, returning trimmed stdout.
pub(crate) async fn git(dir: &Path, args: &[&str]) -> Result<String, GitError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|source| GitError::SpawnFailed {
            program: "git".to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(GitError::CommandFailed {
            args: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run one git command, swallowing failure. Used for steps that are allowed
/// to be no-ops, like deleting a ref that may not exist.
async fn git_allow_fail(dir: &Path, args: &[&str]) {
    if let Err(e) = git(dir, args).await {
        tracing::debug!("git {} (tolerated): {e}", args.join(" "));
    }
}

pub(crate) fn is_denylisted(path: &str) -> bool {
    path.split(['/', '\\'])
        .any(|component| IDE_DENYLIST.contains(&component))
}

/// Stage all changes, then unstage anything on the IDE denylist. Fails with
/// `NothingToCommit` when nothing was staged at all and `OnlyIgnoredChanges`
/// when the denylist emptied the index again; both are no-op outcomes the
/// caller reports rather than raises.
pub(crate) async fn stage_with_denylist(dir: &Path) -> Result<(), GitError> {
    git(dir, &["add", "-A"]).await?;

    let staged_list = git(dir, &["diff", "--cached", "--name-only"]).await?;
    let staged: Vec<&str> = staged_list.lines().filter(|l| !l.is_empty()).collect();
    if staged.is_empty() {
        return Err(GitError::NothingToCommit);
    }

    let denied: Vec<&str> = staged.iter().copied().filter(|p| is_denylisted(p)).collect();
    if !denied.is_empty() {
        let mut args = vec!["restore", "--staged"];
        args.extend(&denied);
        git_allow_fail(dir, &args).await;
    }
    if denied.len() == staged.len() {
        return Err(GitError::OnlyIgnoredChanges);
    }
    Ok(())
}

/// Commit whatever is staged under the bot identity. The message is cut to
/// its first line and at most 100 characters; `--no-verify` bypasses any
/// repository hooks the bot cannot satisfy.
pub(crate) async fn commit_staged(dir: &Path, message: &str) -> Result<String, GitError> {
    let subject: String = message
        .lines()
        .next()
        .unwrap_or("")
        .chars()
        .take(COMMIT_SUBJECT_MAX)
        .collect();

    let user_name = format!("user.name={BOT_NAME}");
    let user_email = format!("user.email={BOT_EMAIL}");
    git(
        dir,
        &[
            "-c",
            &user_name,
            "-c",
            &user_email,
            "commit",
            "--no-verify",
            "-m",
            &subject,
        ],
    )
    .await?;
    Ok(subject)
}

pub(crate) async fn current_branch(dir: &Path) -> Result<String, GitError> {
    git(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).await
}

/// Push the current branch to origin with upstream tracking set.
pub(crate) async fn push_upstream(dir: &Path) -> Result<String, GitError> {
    let branch = current_branch(dir).await?;
    git(dir, &["push", "-u", "origin", &branch]).await?;
    Ok(branch)
}

/// Whether the current branch has an upstream and is not ahead of it, i.e.
/// everything on it was already pushed. Used to skip redundant commit/push
/// when a worktree flow already finished that work.
pub(crate) async fn branch_fully_pushed(dir: &Path) -> Result<bool, GitError> {
    let upstream = git(
        dir,
        &["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{u}"],
    )
    .await;
    if upstream.is_err() {
        return Ok(false);
    }
    let ahead = git(dir, &["rev-list", "--count", "@{u}..HEAD"]).await?;
    Ok(ahead == "0")
}

/// Create a pull request through the hosting-platform CLI. The head branch is
/// passed explicitly so this works even when it is not checked out.
pub(crate) async fn create_pr(
    dir: &Path,
    title: &str,
    body: Option<&str>,
    base: &str,
    head: &str,
) -> Result<String, GitError> {
    let output = Command::new("gh")
        .args(["pr", "create", "--title", title, "--base", base, "--head", head])
        .args(["--body", body.unwrap_or("")])
        .current_dir(dir)
        .output()
        .await
        .map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                GitError::GhCliMissing
            } else {
                GitError::SpawnFailed {
                    program: "gh".to_string(),
                    source,
                }
            }
        })?;

    if !output.status.success() {
        return Err(GitError::PrCreateFailed {
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Lock-protected, job-registered git operations on the main checkout.
///
/// Mutating operations hold the repo lock for their whole duration; `diff`
/// is read-only and runs unguarded.
#[derive(Clone)]
pub struct GitOps {
    locks: Arc<RepoLockManager>,
    jobs: JobRegistry,
    primary_branch: String,
}

impl GitOps {
    pub fn new(
        locks: Arc<RepoLockManager>,
        jobs: JobRegistry,
        primary_branch: impl Into<String>,
    ) -> Self {
        Self {
            locks,
            jobs,
            primary_branch: primary_branch.into(),
        }
    }

    pub fn primary_branch(&self) -> &str {
        &self.primary_branch
    }

    async fn lock(&self, repo: &Path) -> Result<crate::repo::RepoLockGuard, GitError> {
        self.locks
            .acquire(repo)
            .await
            .map_err(|e| GitError::LockFailed {
                repo: repo.to_path_buf(),
                reason: format!("{e:#}"),
            })
    }

    /// Align the main checkout with its remote: clear stale lock artifacts
    /// and a possibly-corrupt remote-tracking ref, prune and re-fetch, stash
    /// any uncommitted local changes, force-reset the primary branch to the
    /// remote tip and remove untracked files.
    pub async fn sync(&self, repo: &Path) -> Result<String, GitError> {
        let _job = self.jobs.begin(repo, JobKind::Sync, "aligning with remote");
        let _lock = self.lock(repo).await?;

        for stale in ["index.lock", "HEAD.lock"] {
            match std::fs::remove_file(repo.join(".git").join(stale)) {
                Ok(()) => tracing::warn!("removed stale .git/{stale}"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("could not remove .git/{stale}: {e}"),
            }
        }
        let remote_ref = format!("refs/remotes/origin/{}", self.primary_branch);
        git_allow_fail(repo, &["update-ref", "-d", &remote_ref]).await;

        git(repo, &["fetch", "--prune", "origin"]).await?;

        let stashed = stash_if_dirty(repo, "codemedic sync").await?;

        let remote_tip = format!("origin/{}", self.primary_branch);
        git(repo, &["checkout", "-B", &self.primary_branch, &remote_tip]).await?;
        git(repo, &["clean", "-fd"]).await?;

        let mut message = format!(
            "Aligned {} with {remote_tip}",
            self.primary_branch
        );
        if stashed {
            message.push_str(" (local changes stashed)");
        }
        Ok(message)
    }

    /// Stage everything, apply the denylist, and commit under the bot
    /// identity. No-op outcomes surface as `NothingToCommit` /
    /// `OnlyIgnoredChanges`.
    pub async fn commit(&self, repo: &Path, message: &str) -> Result<String, GitError> {
        let _job = self.jobs.begin(repo, JobKind::Commit, message);
        let _lock = self.lock(repo).await?;

        stage_with_denylist(repo).await?;
        let subject = commit_staged(repo, message).await?;
        Ok(format!("Committed changes: {subject}"))
    }

    /// Push the current branch to origin with upstream tracking.
    pub async fn push(&self, repo: &Path) -> Result<String, GitError> {
        let _job = self.jobs.begin(repo, JobKind::Push, "pushing current branch");
        let _lock = self.lock(repo).await?;

        let branch = push_upstream(repo).await?;
        Ok(format!("Pushed branch {branch} to origin"))
    }

    /// Commit then push, skipping whatever the branch-readiness probe shows
    /// was already done (a worktree flow may have finished both).
    pub async fn commit_push(&self, repo: &Path, message: &str) -> Result<String, GitError> {
        let _job = self.jobs.begin(repo, JobKind::CommitPush, message);
        let _lock = self.lock(repo).await?;
        self.commit_push_locked(repo, message).await
    }

    async fn commit_push_locked(&self, repo: &Path, message: &str) -> Result<String, GitError> {
        match stage_with_denylist(repo).await {
            Ok(()) => {
                let subject = commit_staged(repo, message).await?;
                let branch = push_upstream(repo).await?;
                Ok(format!("Committed \"{subject}\" and pushed branch {branch}"))
            }
            Err(GitError::NothingToCommit) => {
                if branch_fully_pushed(repo).await? {
                    Ok("Nothing to commit and branch already pushed".to_string())
                } else {
                    let branch = push_upstream(repo).await?;
                    Ok(format!("Nothing new to commit; pushed branch {branch}"))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Commit, push, then open a pull request against the primary branch.
    pub async fn commit_push_pr(
        &self,
        repo: &Path,
        message: &str,
        body: Option<&str>,
    ) -> Result<String, GitError> {
        let _job = self.jobs.begin(repo, JobKind::CommitPushPr, message);

        let branch = {
            let _lock = self.lock(repo).await?;
            self.commit_push_locked(repo, message).await?;
            current_branch(repo).await?
        };

        let title: String = message
            .lines()
            .next()
            .unwrap_or("")
            .chars()
            .take(COMMIT_SUBJECT_MAX)
            .collect();
        let url = create_pr(repo, &title, body, &self.primary_branch, &branch).await?;
        Ok(format!("Pull request created for {branch}: {url}"))
    }

    /// Read-only diff. On a fix branch, shows only the branch's own
    /// contribution (against the merge base with the primary branch);
    /// otherwise diffs the working tree against HEAD. The IDE denylist is
    /// excluded either way.
    pub async fn diff(&self, repo: &Path) -> Result<String, GitError> {
        let excludes: Vec<String> = IDE_DENYLIST
            .iter()
            .map(|name| format!(":(exclude,glob)**/{name}"))
            .collect();

        let branch = current_branch(repo).await?;
        let mut args: Vec<String> = vec!["diff".to_string()];
        if branch.starts_with("fix/") {
            let base = git(repo, &["merge-base", &self.primary_branch, "HEAD"]).await?;
            args.push(base);
            args.push("HEAD".to_string());
        } else {
            args.push("HEAD".to_string());
        }
        args.push("--".to_string());
        args.push(".".to_string());
        args.extend(excludes);

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        git(repo, &arg_refs).await
    }

    /// Revert the working tree and remove untracked files. No branch change.
    pub async fn discard(&self, repo: &Path) -> Result<String, GitError> {
        let _lock = self.lock(repo).await?;
        git(repo, &["checkout", "--", "."]).await?;
        git(repo, &["clean", "-fd"]).await?;
        Ok("Changes discarded.".to_string())
    }
}

/// Stash uncommitted changes if the working tree is dirty. Returns whether a
/// stash was created. Local changes are never discarded outright.
pub(crate) async fn stash_if_dirty(dir: &Path, label: &str) -> Result<bool, GitError> {
    let status = git(dir, &["status", "--porcelain"]).await?;
    if status.is_empty() {
        return Ok(false);
    }
    // stash writes commit objects, so it needs an identity too
    let user_name = format!("user.name={BOT_NAME}");
    let user_email = format!("user.email={BOT_EMAIL}");
    git(
        dir,
        &[
            "-c",
            &user_name,
            "-c",
            &user_email,
            "stash",
            "push",
            "--include-untracked",
            "-m",
            label,
        ],
    )
    .await?;
    Ok(true)
}
