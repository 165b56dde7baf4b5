//! ShardKeeper Error Types

use thiserror::Error;

use crate::node::NodeRole;

/// Result type alias for ShardKeeper operations
pub type Result<T> = std::result::Result<T, Error>;

/// ShardKeeper error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Record errors
    #[error("Invalid record: {0}")]
    Validation(String),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    // Connection errors
    #[error("Connection timeout to {0} node")]
    ConnectionTimeout(NodeRole),

    #[error("No target node reachable for {operation}")]
    NodeUnavailable { operation: String },

    // Two-phase sequence errors
    #[error("Transaction failed on {node} node: {reason}")]
    TransactionError { node: NodeRole, reason: String },

    // Recovery errors
    #[error("Recovery target {0} node unreachable")]
    RecoveryNodeUnavailable(NodeRole),

    #[error("Malformed WAL entry {id}: {reason}")]
    WalCorrupted { id: u64, reason: String },

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Query execution failed: {0}")]
    QueryExecution(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::NodeUnavailable { .. }
                | Error::RecoveryNodeUnavailable(_)
                | Error::Network(_)
        )
    }

    /// Build a transaction error for a node from any displayable cause
    pub fn transaction(node: NodeRole, reason: impl std::fmt::Display) -> Self {
        Error::TransactionError {
            node,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::ConnectionTimeout(NodeRole::Central).is_retryable());
        assert!(Error::NodeUnavailable { operation: "create".into() }.is_retryable());
        assert!(!Error::Validation("name".into()).is_retryable());
        assert!(!Error::transaction(NodeRole::BeforeCutoff, "deadlock").is_retryable());
    }

    #[test]
    fn test_display_names_node_role() {
        let err = Error::transaction(NodeRole::AfterCutoff, "XA PREPARE failed");
        assert_eq!(
            err.to_string(),
            "Transaction failed on after-cutoff node: XA PREPARE failed"
        );
    }
}
