//! Main-checkout git operations — `codemedic sync|diff|discard|commit|push|jobs`.

use anyhow::Result;
use codemedic::config::MedicConfig;
use codemedic::errors::GitError;
use codemedic::git::GitOps;
use codemedic::jobs::JobRegistry;
use codemedic::repo::RepoLockManager;
use console::style;
use std::path::Path;
use std::sync::Arc;

fn git_ops(config: &MedicConfig) -> GitOps {
    GitOps::new(
        Arc::new(RepoLockManager::new()),
        JobRegistry::new(),
        config.repo.primary_branch.clone(),
    )
}

pub async fn cmd_sync(config: &MedicConfig, repo: &Path) -> Result<()> {
    println!("Preparing repo at {}...", repo.display());
    let message = git_ops(config).sync(repo).await?;
    println!("{message}");
    Ok(())
}

pub async fn cmd_diff(config: &MedicConfig, repo: &Path) -> Result<()> {
    let diff = git_ops(config).diff(repo).await?;
    if diff.is_empty() {
        println!("No changes.");
    } else {
        println!("{diff}");
    }
    Ok(())
}

pub async fn cmd_discard(config: &MedicConfig, repo: &Path) -> Result<()> {
    let message = git_ops(config).discard(repo).await?;
    println!("{message}");
    Ok(())
}

pub async fn cmd_commit(
    config: &MedicConfig,
    repo: &Path,
    message: &str,
    push: bool,
    pr: bool,
) -> Result<()> {
    let ops = git_ops(config);
    let result = if pr {
        ops.commit_push_pr(repo, message, None).await
    } else if push {
        ops.commit_push(repo, message).await
    } else {
        ops.commit(repo, message).await
    };

    match result {
        Ok(msg) => println!("{msg}"),
        // no-op outcomes are reported, not raised
        Err(e @ (GitError::NothingToCommit | GitError::OnlyIgnoredChanges)) => {
            println!("{} {e}", style("note:").yellow().bold());
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

pub async fn cmd_push(config: &MedicConfig, repo: &Path) -> Result<()> {
    let message = git_ops(config).push(repo).await?;
    println!("{message}");
    Ok(())
}

/// Job visibility is in-memory and process-local by design, so a one-shot
/// CLI invocation only ever sees its own in-flight work. The long-lived API
/// layer queries the same registry through the library surface.
pub fn cmd_jobs(repo: Option<&Path>) -> Result<()> {
    let registry = JobRegistry::new();
    let jobs = registry.snapshot(repo);
    if jobs.is_empty() {
        println!("No operations in flight.");
        return Ok(());
    }
    for job in jobs {
        println!(
            "{}  {}  {}  {}",
            job.id,
            job.kind.as_str(),
            job.repo_path.display(),
            job.details
        );
    }
    Ok(())
}
