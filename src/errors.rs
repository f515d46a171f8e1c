//! Typed error hierarchy for the CodeMedic core.
//!
//! Two top-level enums cover the two subsystems:
//! - `GitError` — failures and no-op outcomes of the git pipeline
//! - `FixError` — failures of the end-to-end fix orchestration
//!
//! No-op outcomes (`NothingToCommit`, `OnlyIgnoredChanges`) travel as errors
//! so control flow stops, but callers match on them and report them as
//! ordinary messages rather than faults.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the git pipeline subsystem.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {args} failed:\n{stderr}")]
    CommandFailed { args: String, stderr: String },

    #[error("No file changes were detected to commit")]
    NothingToCommit,

    #[error("Only ignored IDE artifacts were changed; no committable changes remained")]
    OnlyIgnoredChanges,

    #[error("The GitHub CLI (gh) was not found on PATH; install it to create pull requests")]
    GhCliMissing,

    #[error("gh pr create failed:\n{stderr}")]
    PrCreateFailed { stderr: String },

    #[error("Failed to acquire repository lock for {repo}: {reason}")]
    LockFailed { repo: PathBuf, reason: String },
}

/// Errors from the fix orchestration subsystem.
#[derive(Debug, Error)]
pub enum FixError {
    #[error("Failed to create worktree: {0}")]
    WorktreeCreation(String),

    #[error("Failed to launch fixing agent '{cmd}': {source}")]
    AgentSpawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_error_spawn_failed_is_matchable() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "git not found");
        let err = GitError::SpawnFailed {
            program: "git".to_string(),
            source: io_err,
        };
        match &err {
            GitError::SpawnFailed { program, source } => {
                assert_eq!(program, "git");
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected SpawnFailed variant"),
        }
    }

    #[test]
    fn git_error_command_failed_carries_stderr() {
        let err = GitError::CommandFailed {
            args: "push -u origin master".to_string(),
            stderr: "remote rejected".to_string(),
        };
        assert!(err.to_string().contains("remote rejected"));
        assert!(err.to_string().contains("push -u origin master"));
    }

    #[test]
    fn no_op_outcomes_are_distinct() {
        let nothing = GitError::NothingToCommit;
        let ignored = GitError::OnlyIgnoredChanges;
        assert!(matches!(nothing, GitError::NothingToCommit));
        assert!(matches!(ignored, GitError::OnlyIgnoredChanges));
        assert_ne!(nothing.to_string(), ignored.to_string());
    }

    #[test]
    fn fix_error_converts_from_git_error() {
        let inner = GitError::GhCliMissing;
        let fix_err: FixError = inner.into();
        match &fix_err {
            FixError::Git(GitError::GhCliMissing) => {}
            _ => panic!("Expected FixError::Git(GhCliMissing)"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        let git_err = GitError::NothingToCommit;
        assert_std_error(&git_err);
        let fix_err = FixError::WorktreeCreation("branch exists".to_string());
        assert_std_error(&fix_err);
    }
}
