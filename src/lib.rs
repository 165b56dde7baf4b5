//! ShardKeeper - Year-Partitioned Record Store
//!
//! Keeps a central MariaDB node and two year partitions consistent. Every
//! record lives on the central node and on exactly one partition, chosen by
//! comparing its `year` with a cutoff.
//!
//! # Architecture
//!
//! Writes are coordinated as XA branches, one per reachable target node.
//! When a target cannot be reached the write still commits on its sibling,
//! together with a write-ahead log entry naming the missing node. The
//! recovery manager later replays those entries and deactivates them.
//!
//! # Features
//!
//! - Two-phase (XA) writes with per-branch rollback
//! - Bounded, timed connection acquisition with retry
//! - WAL fallback for partially unreachable targets
//! - Idempotent recovery with a conditional per-entry claim
//! - Read fan-out with partition fallback
//! - HTTP API and CLI

pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod node;
pub mod record;
pub mod recovery;
pub mod shard;
pub mod wal;

pub use config::ShardKeeperConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ShardKeeperConfig;
    pub use crate::coordinator::{RecordReader, WriteCoordinator};
    pub use crate::error::{Error, Result};
    pub use crate::node::{NodeRegistry, NodeRole, RetryPolicy};
    pub use crate::record::{IsolationLevel, Record};
    pub use crate::recovery::{RecoveryManager, RecoveryReport};
    pub use crate::shard::ShardRouter;
    pub use crate::wal::{WalEntry, WalOperation};
}
