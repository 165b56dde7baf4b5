//! Record Schema
//!
//! The unit of storage, its identifier and the isolation levels forwarded
//! to each node at the start of a write.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Maximum length of the `name` column
pub const MAX_NAME_LEN: usize = 100;

/// Maximum length of each actor name column
pub const MAX_ACTOR_NAME_LEN: usize = 100;

/// A stored record, partitioned by `year`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Assigned by the coordinator on create
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub name: String,
    pub year: i32,
    #[serde(default)]
    pub rank: Option<f64>,
    #[serde(default)]
    pub actor1_first_name: Option<String>,
    #[serde(default)]
    pub actor1_last_name: Option<String>,
    #[serde(default)]
    pub actor2_first_name: Option<String>,
    #[serde(default)]
    pub actor2_last_name: Option<String>,
    #[serde(default)]
    pub actor3_first_name: Option<String>,
    #[serde(default)]
    pub actor3_last_name: Option<String>,
}

/// Payload of a WAL entry that only needs the key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordKey {
    pub id: Uuid,
}

impl Record {
    /// New record without an id or optional columns
    pub fn new(name: impl Into<String>, year: i32) -> Self {
        Self {
            id: None,
            name: name.into(),
            year,
            rank: None,
            actor1_first_name: None,
            actor1_last_name: None,
            actor2_first_name: None,
            actor2_last_name: None,
            actor3_first_name: None,
            actor3_last_name: None,
        }
    }

    /// Returns the id, failing if the record has not been assigned one
    pub fn require_id(&self) -> Result<Uuid> {
        self.id
            .ok_or_else(|| Error::Validation("record id is required".into()))
    }

    /// Check the schema constraints enforced at the coordinator boundary
    pub fn validate(&self) -> Result<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(Error::Validation("name cannot be empty".into()));
        }
        if self.name.chars().count() > MAX_NAME_LEN {
            return Err(Error::Validation(format!(
                "name exceeds {} characters",
                MAX_NAME_LEN
            )));
        }
        if let Some(rank) = self.rank {
            if !rank.is_finite() {
                return Err(Error::Validation("rank must be a finite number".into()));
            }
        }
        for (column, value) in self.actor_columns() {
            if let Some(value) = value {
                if value.chars().count() > MAX_ACTOR_NAME_LEN {
                    return Err(Error::Validation(format!(
                        "{} exceeds {} characters",
                        column, MAX_ACTOR_NAME_LEN
                    )));
                }
            }
        }
        Ok(())
    }

    /// The six nullable actor columns paired with their column names
    pub fn actor_columns(&self) -> [(&'static str, Option<&str>); 6] {
        [
            ("actor1_first_name", self.actor1_first_name.as_deref()),
            ("actor1_last_name", self.actor1_last_name.as_deref()),
            ("actor2_first_name", self.actor2_first_name.as_deref()),
            ("actor2_last_name", self.actor2_last_name.as_deref()),
            ("actor3_first_name", self.actor3_first_name.as_deref()),
            ("actor3_last_name", self.actor3_last_name.as_deref()),
        ]
    }
}

/// Transaction isolation level, forwarded verbatim to every target node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum IsolationLevel {
    #[serde(rename = "READ UNCOMMITTED")]
    ReadUncommitted,
    #[serde(rename = "READ COMMITTED")]
    ReadCommitted,
    #[default]
    #[serde(rename = "REPEATABLE READ")]
    RepeatableRead,
    #[serde(rename = "SERIALIZABLE")]
    Serializable,
}

impl IsolationLevel {
    pub const ALL: [IsolationLevel; 4] = [
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ];

    /// SQL keyword form
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl std::str::FromStr for IsolationLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().replace(['_', '-'], " ").to_uppercase();
        IsolationLevel::ALL
            .into_iter()
            .find(|level| level.as_sql() == normalized)
            .ok_or_else(|| Error::Validation(format!("unknown isolation level: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_blank_name() {
        let record = Record::new("   ", 1999);
        assert!(matches!(record.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_long_actor() {
        let mut record = Record::new("Melanie Darrow", 1997);
        record.actor2_last_name = Some("x".repeat(MAX_ACTOR_NAME_LEN + 1));
        let err = record.validate().unwrap_err();
        assert!(err.to_string().contains("actor2_last_name"));
    }

    #[test]
    fn test_validate_rejects_nan_rank() {
        let mut record = Record::new("Melankholicheskij vals", 1990);
        record.rank = Some(f64::NAN);
        assert!(record.validate().is_err());
    }

    #[test]
    fn test_json_shape() {
        let mut record = Record::new("X", 1975);
        record.actor1_first_name = Some("Bruce (I)".into());
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("id").is_none());
        assert_eq!(json["year"], 1975);
        assert_eq!(json["rank"], serde_json::Value::Null);

        let parsed: Record = serde_json::from_str(r#"{"name":"X","year":1975}"#).unwrap();
        assert_eq!(parsed, Record::new("X", 1975));
    }

    #[test]
    fn test_isolation_level_parsing() {
        assert_eq!(
            "read committed".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            "REPEATABLE_READ".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::RepeatableRead
        );
        assert!("SNAPSHOT".parse::<IsolationLevel>().is_err());
        assert_eq!(IsolationLevel::default().to_string(), "REPEATABLE READ");
    }
}
