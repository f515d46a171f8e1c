//! Log analysis — `codemedic analyze`.

use anyhow::{Context, Result};
use codemedic::cluster::{self, ErrorCluster};
use console::style;
use std::path::Path;

const MESSAGE_DISPLAY_MAX: usize = 70;

/// Parse `log_path`, print the ranked cluster table (or JSON for machine
/// consumers), and return the clusters so the fix flow can reuse them.
pub fn cmd_analyze(log_path: &Path, as_json: bool) -> Result<Vec<ErrorCluster>> {
    let content = std::fs::read_to_string(log_path)
        .with_context(|| format!("Failed to read log file {}", log_path.display()))?;
    let clusters = cluster::cluster(&content);

    if as_json {
        println!("{}", serde_json::to_string_pretty(&clusters)?);
        return Ok(clusters);
    }

    if clusters.is_empty() {
        println!("No errors found in the log.");
        return Ok(clusters);
    }

    println!();
    println!(
        "{}",
        style(format!("{:<5} | {:<8} | Error Message", "ID", "Count")).bold()
    );
    println!("{}", "-".repeat(78));
    for (idx, cluster) in clusters.iter().enumerate() {
        let first_line = cluster.message.lines().next().unwrap_or("");
        let display = if first_line.chars().count() > MESSAGE_DISPLAY_MAX {
            let truncated: String = first_line.chars().take(MESSAGE_DISPLAY_MAX).collect();
            format!("{truncated}...")
        } else {
            first_line.to_string()
        };
        println!("[{:<3}] | {:<8} | {display}", idx + 1, cluster.count);
    }
    println!();

    Ok(clusters)
}
