//! Interactive fix dispatch — `codemedic fix`.
//!
//! Analyzes the configured log, lets the operator pick a cluster, then
//! streams the fixing agent's output to the terminal while the orchestrator
//! runs. Ctrl-C cancels the in-flight agent through the process table
//! instead of abandoning it.

use anyhow::Result;
use codemedic::config::MedicConfig;
use codemedic::fix::{FixEvent, FixOrchestrator};
use codemedic::jobs::{JobRegistry, ProcessTable};
use codemedic::repo::RepoLockManager;
use console::style;
use dialoguer::Select;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

pub async fn cmd_fix(
    config: &MedicConfig,
    repo: &Path,
    log_path: &Path,
    model: Option<String>,
) -> Result<()> {
    let clusters = super::cmd_analyze(log_path, false)?;
    if clusters.is_empty() {
        return Ok(());
    }

    let items: Vec<String> = clusters
        .iter()
        .map(|c| {
            let first_line = c.message.lines().next().unwrap_or("");
            format!("[{}x] {first_line}", c.count)
        })
        .collect();
    let selection = Select::new()
        .with_prompt("Select an error to fix")
        .items(&items)
        .default(0)
        .interact()?;
    let selected = &clusters[selection];
    println!();
    println!("Selected: {}", selected.message.lines().next().unwrap_or(""));
    println!("Delegating fix to {}...", config.agent.cmd);

    let orchestrator = FixOrchestrator::new(
        config.agent.clone(),
        config.repo.primary_branch.clone(),
        Arc::new(RepoLockManager::new()),
        JobRegistry::new(),
        ProcessTable::new(),
    );
    let job_id = Uuid::new_v4().to_string();
    let mut rx = orchestrator.run_fix(
        repo.to_path_buf(),
        selected.trace.clone(),
        job_id.clone(),
        model,
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                eprintln!("Cancelling fix...");
                if !orchestrator.cancel(&job_id).await {
                    eprintln!("No running agent process to cancel.");
                }
                // the terminal event still arrives through the channel
            }
            event = rx.recv() => match event {
                Some(FixEvent::Log { line }) => {
                    println!("{} {line}", style("[agent]").dim());
                }
                Some(FixEvent::Completed { success, message, branch_name }) => {
                    println!();
                    if success {
                        println!("{} {message}", style("ok:").green().bold());
                        if let Some(branch) = branch_name {
                            println!(
                                "Review with: git diff {}...{branch}",
                                config.repo.primary_branch
                            );
                        }
                    } else {
                        println!("{} {message}", style("failed:").red().bold());
                    }
                    break;
                }
                None => break,
            }
        }
    }

    Ok(())
}
