//! Coordinator Module
//!
//! Cross-node writes and reads over the node registry.

mod branch;
mod read;
mod write;

pub use branch::{commit_branch, prepare_branch, rollback_branch, run_branch, PreparedBranch};
pub use read::{RankReport, RecordReader};
pub use write::WriteCoordinator;
