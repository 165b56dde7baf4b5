//! Node Registry Module
//!
//! The three database nodes (central plus two year partitions), the seam
//! between the coordinator and a concrete database, and connection
//! acquisition with bounded retry.

pub mod acquire;
pub mod memory;
mod mysql;
mod statement;

pub use acquire::{Acquired, RetryPolicy, MAX_RETRY_DELAY};
pub use mysql::MySqlNode;
pub use statement::{RankAggregate, RecordQuery, Statement};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ShardKeeperConfig;
use crate::error::{Error, Result};
use crate::record::Record;
use crate::wal::WalEntry;

/// Role of a node in the topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    /// Mirror of every record
    Central,
    /// Owner of records with `year` below the cutoff
    BeforeCutoff,
    /// Owner of records with `year` at or above the cutoff
    AfterCutoff,
}

impl NodeRole {
    /// Every role, in the order reads and deletes visit them
    pub const ALL: [NodeRole; 3] = [NodeRole::Central, NodeRole::BeforeCutoff, NodeRole::AfterCutoff];

    /// Form stored in the `node` column of a WAL entry
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Central => "central",
            NodeRole::BeforeCutoff => "before-cutoff",
            NodeRole::AfterCutoff => "after-cutoff",
        }
    }

    /// Key under `[nodes]` in the configuration file
    pub fn config_key(&self) -> &'static str {
        match self {
            NodeRole::Central => "central",
            NodeRole::BeforeCutoff => "before_cutoff",
            NodeRole::AfterCutoff => "after_cutoff",
        }
    }

    fn index(&self) -> usize {
        match self {
            NodeRole::Central => 0,
            NodeRole::BeforeCutoff => 1,
            NodeRole::AfterCutoff => 2,
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for NodeRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        NodeRole::ALL
            .into_iter()
            .find(|role| role.as_str() == s || role.config_key() == s)
            .ok_or_else(|| Error::Validation(format!("unknown node role: {}", s)))
    }
}

/// A database node that can lease sessions
#[async_trait]
pub trait NodeBackend: Send + Sync {
    /// Make a single attempt at leasing a session from the node's pool
    async fn connect(&self) -> Result<Box<dyn NodeSession>>;

    /// Close the pool; later `connect` calls fail
    async fn close(&self);
}

/// A leased connection, returned to its pool when dropped
#[async_trait]
pub trait NodeSession: Send {
    /// Execute a statement, returning the number of affected rows
    async fn execute(&mut self, statement: &Statement) -> Result<u64>;

    /// Fetch records matching a query
    async fn fetch_records(&mut self, query: &RecordQuery) -> Result<Vec<Record>>;

    /// Fetch every WAL entry still marked active, oldest first
    async fn fetch_active_wal(&mut self) -> Result<Vec<WalEntry>>;

    /// Aggregate the `rank` column over all records on this node
    async fn aggregate_rank(&mut self, aggregate: RankAggregate) -> Result<Option<f64>>;

    /// Close the underlying connection instead of returning it to the pool.
    /// Used when a branch may still be open on it; later calls fail.
    async fn discard(&mut self);
}

/// The central node and both partitions, each owning its pool
pub struct NodeRegistry {
    nodes: [Arc<dyn NodeBackend>; 3],
}

impl NodeRegistry {
    /// Build lazy MySQL pools for every configured node.
    ///
    /// No connection is made here, so an unreachable node does not prevent
    /// the registry from opening.
    pub fn open(config: &ShardKeeperConfig) -> Result<Self> {
        let timeout = config.retry_policy().timeout;
        let build = |role: NodeRole| -> Result<Arc<dyn NodeBackend>> {
            let node = MySqlNode::new(role, config.nodes.get(role), timeout)?;
            tracing::info!("Registered {} node at {}", role, config.nodes.get(role).endpoint());
            Ok(Arc::new(node))
        };

        Ok(Self {
            nodes: [
                build(NodeRole::Central)?,
                build(NodeRole::BeforeCutoff)?,
                build(NodeRole::AfterCutoff)?,
            ],
        })
    }

    /// Build a registry from explicit backends
    pub fn from_backends(
        central: Arc<dyn NodeBackend>,
        before_cutoff: Arc<dyn NodeBackend>,
        after_cutoff: Arc<dyn NodeBackend>,
    ) -> Self {
        Self {
            nodes: [central, before_cutoff, after_cutoff],
        }
    }

    /// Backend for a role
    pub fn backend(&self, role: NodeRole) -> &Arc<dyn NodeBackend> {
        &self.nodes[role.index()]
    }

    /// Lease a session for a role under the given retry policy
    pub async fn acquire(&self, role: NodeRole, policy: &RetryPolicy) -> Acquired {
        acquire::acquire(role, self.backend(role).as_ref(), policy).await
    }

    /// Create the `records` and `wal_entries` tables on every reachable node.
    ///
    /// Returns the roles that could not be reached.
    pub async fn ensure_schema(&self, policy: &RetryPolicy) -> Result<Vec<NodeRole>> {
        let mut unreachable = Vec::new();
        for role in NodeRole::ALL {
            match self.acquire(role, policy).await {
                Acquired::Connected(mut session) => {
                    session.execute(&Statement::CreateRecordsTable).await?;
                    session.execute(&Statement::CreateWalTable).await?;
                    tracing::info!("Schema ready on {} node", role);
                }
                Acquired::Unavailable => unreachable.push(role),
            }
        }
        Ok(unreachable)
    }

    /// Close every pool
    pub async fn close_all(&self) {
        for role in NodeRole::ALL {
            self.backend(role).close().await;
        }
        tracing::info!("All node pools closed");
    }
}
