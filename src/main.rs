use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use codemedic::config::MedicConfig;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "codemedic")]
#[command(version, about = "Cluster recurring log errors and dispatch automated fixes")]
pub struct Cli {
    /// Verbose logging (debug level)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Repository checkout to operate on (defaults to [repo].path in codemedic.toml)
    #[arg(long, global = true)]
    pub repo: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse a log file and print the ranked error clusters
    Analyze {
        /// Log file to parse (defaults to [log].file_path in codemedic.toml)
        #[arg(short, long)]
        log: Option<PathBuf>,

        /// Emit the clusters as JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Pick an error cluster and dispatch the fixing agent against it
    Fix {
        /// Log file to parse (defaults to [log].file_path in codemedic.toml)
        #[arg(short, long)]
        log: Option<PathBuf>,

        /// Model to forward to the fixing agent
        #[arg(short, long)]
        model: Option<String>,
    },
    /// Align the main checkout with its remote
    Sync,
    /// Show pending changes (only the branch's own contribution on fix branches)
    Diff,
    /// Revert the working tree and remove untracked files
    Discard,
    /// Commit all changes under the bot identity
    Commit {
        /// Commit message (cut to its first line, 100 characters)
        message: String,

        /// Also push the current branch
        #[arg(long)]
        push: bool,

        /// Also push and open a pull request against the primary branch
        #[arg(long)]
        pr: bool,
    },
    /// Push the current branch with upstream tracking
    Push,
    /// List in-flight operations in this process
    Jobs,
    /// List models the fixing agent supports
    Models,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "codemedic=debug"
    } else {
        "codemedic=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let config = MedicConfig::load(&cwd)?;

    match &cli.command {
        Commands::Analyze { log, json } => {
            let log = resolve_log(&config, log.as_deref())?;
            cmd::cmd_analyze(&log, *json)?;
        }
        Commands::Fix { log, model } => {
            let repo = resolve_repo(&cli, &config)?;
            let log = resolve_log(&config, log.as_deref())?;
            cmd::cmd_fix(&config, &repo, &log, model.clone()).await?;
        }
        Commands::Sync => cmd::cmd_sync(&config, &resolve_repo(&cli, &config)?).await?,
        Commands::Diff => cmd::cmd_diff(&config, &resolve_repo(&cli, &config)?).await?,
        Commands::Discard => cmd::cmd_discard(&config, &resolve_repo(&cli, &config)?).await?,
        Commands::Commit { message, push, pr } => {
            cmd::cmd_commit(&config, &resolve_repo(&cli, &config)?, message, *push, *pr).await?
        }
        Commands::Push => cmd::cmd_push(&config, &resolve_repo(&cli, &config)?).await?,
        Commands::Jobs => cmd::cmd_jobs(cli.repo.as_deref())?,
        Commands::Models => cmd::cmd_models(&config).await?,
    }

    Ok(())
}

fn resolve_repo(cli: &Cli, config: &MedicConfig) -> Result<PathBuf> {
    cli.repo
        .clone()
        .or_else(|| config.repo.path.clone())
        .context("No repository configured; pass --repo or set [repo].path in codemedic.toml")
}

fn resolve_log(config: &MedicConfig, flag: Option<&Path>) -> Result<PathBuf> {
    flag.map(Path::to_path_buf)
        .or_else(|| config.log.file_path.clone())
        .context("No log file configured; pass --log or set [log].file_path in codemedic.toml")
}
