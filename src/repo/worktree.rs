//! Isolated, branch-scoped secondary checkouts.
//!
//! A worktree gives a long-running fix operation its own checkout so the
//! main one stays usable throughout. Creation and destruction lean on git's
//! native concurrent-worktree support and need no repository lock. The one
//! invariant callers must respect: a branch checked out in a live worktree
//! cannot be checked out anywhere else, so the worktree must be destroyed
//! before the branch is adopted into the main checkout.

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Create a new branch off `base_branch` and check it out into a fresh
/// temporary directory outside the main checkout. On failure any partially
/// created directory is removed.
pub async fn create(repo: &Path, branch: &str, base_branch: &str) -> Result<PathBuf> {
    let dir_name = format!(
        "codemedic-wt-{}",
        branch.replace(['/', '\\'], "-")
    );
    let path = std::env::temp_dir().join(dir_name);

    let output = Command::new("git")
        .args(["worktree", "add", "-b", branch])
        .arg(&path)
        .arg(base_branch)
        .current_dir(repo)
        .output()
        .await
        .context("Failed to run git worktree add")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let _ = tokio::fs::remove_dir_all(&path).await;
        bail!("Git worktree creation failed: {}", stderr.trim());
    }

    Ok(path)
}

/// Unregister `worktree` and remove its directory. Idempotent: an already
/// removed worktree is a no-op, and any other failure is logged but never
/// escalated — destruction is a cleanup action, not an operation outcome.
pub async fn destroy(repo: &Path, worktree: &Path) {
    match Command::new("git")
        .args(["worktree", "remove", "--force"])
        .arg(worktree)
        .current_dir(repo)
        .output()
        .await
    {
        Ok(output) if !output.status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            if !stderr.contains("is not a working tree") && !stderr.contains("No such file") {
                tracing::warn!(
                    "git worktree remove for {} failed: {stderr}",
                    worktree.display()
                );
            }
        }
        Err(e) => tracing::warn!("failed to run git worktree remove: {e}"),
        _ => {}
    }

    match tokio::fs::remove_dir_all(worktree).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(
            "failed to remove worktree directory {}: {e}",
            worktree.display()
        ),
    }
}
