//! Repository-level primitives: the composite repo lock and the isolated
//! worktree lifecycle.

pub mod lock;
pub mod worktree;

pub use lock::{RepoLockGuard, RepoLockManager};
