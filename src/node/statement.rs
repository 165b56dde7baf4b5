//! Node Statements
//!
//! Every write a node can be asked to perform, independent of the backend
//! that executes it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::record::{IsolationLevel, Record};
use crate::wal::NewWalEntry;

/// Records table name
pub const RECORDS_TABLE: &str = "records";

/// WAL table name
pub const WAL_TABLE: &str = "wal_entries";

/// Columns of the records table, in insert order
pub const RECORD_COLUMNS: [&str; 10] = [
    "id",
    "name",
    "year",
    "rank",
    "actor1_first_name",
    "actor1_last_name",
    "actor2_first_name",
    "actor2_last_name",
    "actor3_first_name",
    "actor3_last_name",
];

/// A single statement executed on one node
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Applies to the next transaction started on the session
    SetIsolationLevel(IsolationLevel),
    XaStart(String),
    XaEnd(String),
    XaPrepare(String),
    XaCommit(String),
    XaRollback(String),
    /// Plain insert, fails on a duplicate id
    InsertRecord(Record),
    /// Insert or overwrite by id
    UpsertRecord(Record),
    DeleteRecord(Uuid),
    AppendWal(NewWalEntry),
    /// Flip an entry's active flag, only if it is still active
    DeactivateWal(u64),
    CreateRecordsTable,
    CreateWalTable,
}

impl Statement {
    /// Short label used in logs
    pub fn label(&self) -> String {
        match self {
            Statement::SetIsolationLevel(_) => "SET TRANSACTION ISOLATION LEVEL".into(),
            Statement::XaStart(_) => "XA START".into(),
            Statement::XaEnd(_) => "XA END".into(),
            Statement::XaPrepare(_) => "XA PREPARE".into(),
            Statement::XaCommit(_) => "XA COMMIT".into(),
            Statement::XaRollback(_) => "XA ROLLBACK".into(),
            Statement::InsertRecord(_) => format!("INSERT {}", RECORDS_TABLE),
            Statement::UpsertRecord(_) => format!("UPSERT {}", RECORDS_TABLE),
            Statement::DeleteRecord(_) => format!("DELETE {}", RECORDS_TABLE),
            Statement::AppendWal(_) => format!("INSERT {}", WAL_TABLE),
            Statement::DeactivateWal(_) => format!("UPDATE {}", WAL_TABLE),
            Statement::CreateRecordsTable => format!("CREATE TABLE {}", RECORDS_TABLE),
            Statement::CreateWalTable => format!("CREATE TABLE {}", WAL_TABLE),
        }
    }

    /// Text-protocol SQL for statements that carry no bound parameters.
    ///
    /// XA and SET statements cannot be prepared, so they go over the text
    /// protocol. Returns `None` for data statements.
    pub fn control_sql(&self) -> Option<String> {
        let sql = match self {
            Statement::SetIsolationLevel(level) => {
                format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql())
            }
            Statement::XaStart(xid) => format!("XA START {}", quote_xid(xid)),
            Statement::XaEnd(xid) => format!("XA END {}", quote_xid(xid)),
            Statement::XaPrepare(xid) => format!("XA PREPARE {}", quote_xid(xid)),
            Statement::XaCommit(xid) => format!("XA COMMIT {}", quote_xid(xid)),
            Statement::XaRollback(xid) => format!("XA ROLLBACK {}", quote_xid(xid)),
            Statement::CreateRecordsTable => format!(
                r#"CREATE TABLE IF NOT EXISTS `{}` (
                    `id` VARCHAR(36) NOT NULL,
                    `name` VARCHAR(100) NOT NULL,
                    `year` INT NOT NULL,
                    `rank` DOUBLE NULL,
                    `actor1_first_name` VARCHAR(100) NULL,
                    `actor1_last_name` VARCHAR(100) NULL,
                    `actor2_first_name` VARCHAR(100) NULL,
                    `actor2_last_name` VARCHAR(100) NULL,
                    `actor3_first_name` VARCHAR(100) NULL,
                    `actor3_last_name` VARCHAR(100) NULL,
                    PRIMARY KEY (`id`),
                    KEY `idx_records_name` (`name`)
                ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"#,
                RECORDS_TABLE
            ),
            Statement::CreateWalTable => format!(
                r#"CREATE TABLE IF NOT EXISTS `{}` (
                    `id` BIGINT UNSIGNED NOT NULL AUTO_INCREMENT,
                    `operation` VARCHAR(10) NOT NULL,
                    `node` VARCHAR(20) NOT NULL,
                    `value` TEXT NOT NULL,
                    `active` TINYINT(1) NOT NULL DEFAULT 1,
                    `created_at` TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
                    PRIMARY KEY (`id`),
                    KEY `idx_wal_active` (`active`)
                ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"#,
                WAL_TABLE
            ),
            _ => return None,
        };
        Some(sql)
    }

    /// Transaction id carried by an XA statement
    pub fn xid(&self) -> Option<&str> {
        match self {
            Statement::XaStart(xid)
            | Statement::XaEnd(xid)
            | Statement::XaPrepare(xid)
            | Statement::XaCommit(xid)
            | Statement::XaRollback(xid) => Some(xid),
            _ => None,
        }
    }

    /// Whether this statement changes rows and must run inside a branch
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Statement::InsertRecord(_)
                | Statement::UpsertRecord(_)
                | Statement::DeleteRecord(_)
                | Statement::AppendWal(_)
        )
    }
}

/// Callers check ids with `validate_xid` before rendering
fn quote_xid(xid: &str) -> String {
    format!("'{}'", xid)
}

/// Check that an xid is safe to embed in XA statements
pub fn validate_xid(xid: &str) -> Result<()> {
    if xid.is_empty() || xid.len() > 64 || !xid.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
        return Err(Error::Validation(format!("invalid xid: {}", xid)));
    }
    Ok(())
}

/// Read queries against the records table
#[derive(Debug, Clone, PartialEq)]
pub enum RecordQuery {
    ById(Uuid),
    All { limit: u32 },
    /// Case-insensitive substring match on `name`
    NameContains { needle: String, limit: u32 },
}

impl RecordQuery {
    /// Whether a record satisfies the query's filter (limit not applied)
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            RecordQuery::ById(id) => record.id == Some(*id),
            RecordQuery::All { .. } => true,
            RecordQuery::NameContains { needle, .. } => record
                .name
                .to_lowercase()
                .contains(&needle.to_lowercase()),
        }
    }

    pub fn limit(&self) -> u32 {
        match self {
            RecordQuery::ById(_) => 1,
            RecordQuery::All { limit } | RecordQuery::NameContains { limit, .. } => *limit,
        }
    }
}

/// Aggregate functions over the `rank` column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RankAggregate {
    Avg,
    Min,
    Max,
    Sum,
    Count,
}

impl RankAggregate {
    pub fn sql_function(&self) -> &'static str {
        match self {
            RankAggregate::Avg => "AVG",
            RankAggregate::Min => "MIN",
            RankAggregate::Max => "MAX",
            RankAggregate::Sum => "SUM",
            RankAggregate::Count => "COUNT",
        }
    }

    /// Compute the aggregate over in-memory ranks, with SQL NULL semantics
    pub fn apply(&self, ranks: impl Iterator<Item = Option<f64>>) -> Option<f64> {
        let values: Vec<f64> = ranks.flatten().collect();
        match self {
            RankAggregate::Count => Some(values.len() as f64),
            _ if values.is_empty() => None,
            RankAggregate::Sum => Some(values.iter().sum()),
            RankAggregate::Avg => Some(values.iter().sum::<f64>() / values.len() as f64),
            RankAggregate::Min => values.iter().copied().reduce(f64::min),
            RankAggregate::Max => values.iter().copied().reduce(f64::max),
        }
    }
}

impl std::str::FromStr for RankAggregate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "avg" | "average" => Ok(RankAggregate::Avg),
            "min" => Ok(RankAggregate::Min),
            "max" => Ok(RankAggregate::Max),
            "sum" => Ok(RankAggregate::Sum),
            "count" => Ok(RankAggregate::Count),
            _ => Err(Error::Validation(format!("unknown aggregate: {}", s))),
        }
    }
}
