//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                                    |
//! |-----------|-----------------------------------------------------|
//! | `analyze` | `Analyze`                                           |
//! | `fix`     | `Fix`                                               |
//! | `models`  | `Models`                                            |
//! | `repo`    | `Sync`, `Diff`, `Discard`, `Commit`, `Push`, `Jobs` |

pub mod analyze;
pub mod fix;
pub mod models;
pub mod repo;

pub use analyze::cmd_analyze;
pub use fix::cmd_fix;
pub use models::cmd_models;
pub use repo::{cmd_commit, cmd_diff, cmd_discard, cmd_jobs, cmd_push, cmd_sync};
