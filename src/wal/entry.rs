//! WAL Entry Types
//!
//! A WAL entry records a write that reached one node but is still owed to a
//! sibling that was unreachable at the time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::node::{NodeRole, Statement};
use crate::record::{Record, RecordKey};

/// Kind of write carried by an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalOperation {
    Insert,
    Update,
    Delete,
}

impl WalOperation {
    /// Form stored in the `operation` column
    pub fn as_str(&self) -> &'static str {
        match self {
            WalOperation::Insert => "insert",
            WalOperation::Update => "update",
            WalOperation::Delete => "delete",
        }
    }
}

impl std::fmt::Display for WalOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WalOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(WalOperation::Insert),
            "update" => Ok(WalOperation::Update),
            "delete" => Ok(WalOperation::Delete),
            _ => Err(Error::Validation(format!("unknown WAL operation: {}", s))),
        }
    }
}

/// An entry about to be appended, before the node assigns its id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWalEntry {
    pub operation: WalOperation,
    /// Node the write is owed to
    pub node: NodeRole,
    /// JSON payload
    pub value: String,
}

impl NewWalEntry {
    /// Entry for an insert or update owed to `target`
    pub fn for_record(operation: WalOperation, target: NodeRole, record: &Record) -> Result<Self> {
        if operation == WalOperation::Delete {
            return Err(Error::Validation("delete entries carry only a key".into()));
        }
        record.require_id()?;
        Ok(Self {
            operation,
            node: target,
            value: serde_json::to_string(record)?,
        })
    }

    /// Entry for a delete owed to `target`
    pub fn for_delete(target: NodeRole, id: Uuid) -> Result<Self> {
        Ok(Self {
            operation: WalOperation::Delete,
            node: target,
            value: serde_json::to_string(&RecordKey { id })?,
        })
    }
}

/// A persisted entry, as read back from a node's `wal_entries` table.
///
/// `operation` and `node` stay raw so one malformed row does not hide the
/// rest of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    pub id: u64,
    pub operation: String,
    pub node: String,
    pub value: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl WalEntry {
    /// Node the entry is owed to
    pub fn target(&self) -> Result<NodeRole> {
        self.node.parse().map_err(|_| Error::WalCorrupted {
            id: self.id,
            reason: format!("unknown target node '{}'", self.node),
        })
    }

    pub fn operation(&self) -> Result<WalOperation> {
        self.operation.parse().map_err(|_| Error::WalCorrupted {
            id: self.id,
            reason: format!("unknown operation '{}'", self.operation),
        })
    }

    /// Statement that brings the target in line with this entry.
    ///
    /// Inserts and updates both replay as upserts: re-delivery after a crash
    /// between replay and deactivation cannot fail on a duplicate key, and an
    /// update that moved a record across the cutoff lands on a partition
    /// that never held it.
    pub fn replay_statement(&self) -> Result<Statement> {
        match self.operation()? {
            WalOperation::Insert | WalOperation::Update => Ok(Statement::UpsertRecord(self.record_payload()?)),
            WalOperation::Delete => {
                let key: RecordKey = serde_json::from_str(&self.value).map_err(|e| self.corrupted(e))?;
                Ok(Statement::DeleteRecord(key.id))
            }
        }
    }

    fn record_payload(&self) -> Result<Record> {
        let record: Record = serde_json::from_str(&self.value).map_err(|e| self.corrupted(e))?;
        if record.id.is_none() {
            return Err(self.corrupted("record payload has no id"));
        }
        Ok(record)
    }

    fn corrupted(&self, reason: impl std::fmt::Display) -> Error {
        Error::WalCorrupted {
            id: self.id,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persisted(new: &NewWalEntry, id: u64) -> WalEntry {
        WalEntry {
            id,
            operation: new.operation.as_str().to_string(),
            node: new.node.as_str().to_string(),
            value: new.value.clone(),
            active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_entry_replays_as_upsert() {
        let mut record = Record::new("X", 1975);
        record.id = Some(Uuid::new_v4());

        let new = NewWalEntry::for_record(WalOperation::Insert, NodeRole::BeforeCutoff, &record).unwrap();
        let entry = persisted(&new, 1);

        assert_eq!(entry.target().unwrap(), NodeRole::BeforeCutoff);
        assert_eq!(entry.replay_statement().unwrap(), Statement::UpsertRecord(record));
    }

    #[test]
    fn test_update_entry_replays_as_upsert() {
        let mut record = Record::new("Melanios letzte Liebe", 1991);
        record.id = Some(Uuid::new_v4());

        let new = NewWalEntry::for_record(WalOperation::Update, NodeRole::AfterCutoff, &record).unwrap();
        let entry = persisted(&new, 3);

        assert_eq!(entry.operation().unwrap(), WalOperation::Update);
        assert_eq!(entry.replay_statement().unwrap(), Statement::UpsertRecord(record));
    }

    #[test]
    fn test_delete_entry_carries_key_only() {
        let id = Uuid::new_v4();
        let new = NewWalEntry::for_delete(NodeRole::AfterCutoff, id).unwrap();
        assert_eq!(new.value, format!("{{\"id\":\"{}\"}}", id));
        assert_eq!(persisted(&new, 2).replay_statement().unwrap(), Statement::DeleteRecord(id));
    }

    #[test]
    fn test_record_entry_requires_id() {
        let record = Record::new("No Id", 1990);
        assert!(NewWalEntry::for_record(WalOperation::Update, NodeRole::Central, &record).is_err());
    }

    #[test]
    fn test_malformed_entries_are_reported() {
        let mut entry = persisted(&NewWalEntry::for_delete(NodeRole::Central, Uuid::new_v4()).unwrap(), 7);
        entry.node = "node-9".into();
        assert!(matches!(entry.target(), Err(Error::WalCorrupted { id: 7, .. })));

        entry.operation = "insert".into();
        entry.value = "{not json".into();
        assert!(matches!(entry.replay_statement(), Err(Error::WalCorrupted { id: 7, .. })));
    }
}
