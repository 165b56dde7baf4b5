//! Shard Router
//!
//! Maps a record to the nodes that must hold it: the central node plus the
//! partition that owns the record's year.

use crate::node::NodeRole;
use crate::record::Record;

/// Default partition cutoff year
pub const DEFAULT_CUTOFF_YEAR: i32 = 1980;

/// Year-based router
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    cutoff_year: i32,
}

impl ShardRouter {
    pub fn new(cutoff_year: i32) -> Self {
        Self { cutoff_year }
    }

    pub fn cutoff_year(&self) -> i32 {
        self.cutoff_year
    }

    /// Partition that owns a year
    pub fn partition_for(&self, year: i32) -> NodeRole {
        if year < self.cutoff_year {
            NodeRole::BeforeCutoff
        } else {
            NodeRole::AfterCutoff
        }
    }

    /// Partition that must not hold a record of this year
    pub fn non_owner(&self, year: i32) -> NodeRole {
        match self.partition_for(year) {
            NodeRole::BeforeCutoff => NodeRole::AfterCutoff,
            _ => NodeRole::BeforeCutoff,
        }
    }

    /// Ordered (central, partition) pair for a record
    pub fn route(&self, record: &Record) -> (NodeRole, NodeRole) {
        (NodeRole::Central, self.partition_for(record.year))
    }
}

impl Default for ShardRouter {
    fn default() -> Self {
        Self::new(DEFAULT_CUTOFF_YEAR)
    }
}
