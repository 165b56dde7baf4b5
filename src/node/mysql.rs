//! MariaDB / MySQL Node
//!
//! Executes statements against a MariaDB database through an sqlx pool.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnection, MySqlPoolOptions, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::{Connection, Executor, MySql, MySqlPool, Row};
use uuid::Uuid;

use super::statement::{validate_xid, RECORDS_TABLE, RECORD_COLUMNS, WAL_TABLE};
use super::{NodeBackend, NodeRole, NodeSession, RankAggregate, RecordQuery, Statement};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::record::Record;
use crate::wal::{NewWalEntry, WalEntry};

/// A node backed by a lazily connecting MySQL pool
pub struct MySqlNode {
    role: NodeRole,
    pool: MySqlPool,
}

impl MySqlNode {
    /// Build the pool without connecting
    pub fn new(role: NodeRole, config: &DatabaseConfig, acquire_timeout: Duration) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(&config.url())?;

        Ok(Self { role, pool })
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }
}

#[async_trait]
impl NodeBackend for MySqlNode {
    async fn connect(&self) -> Result<Box<dyn NodeSession>> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(MySqlSession {
            role: self.role,
            conn: Some(conn),
        }))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// A pooled connection; returned to the pool on drop unless discarded
struct MySqlSession {
    role: NodeRole,
    conn: Option<PoolConnection<MySql>>,
}

fn insert_sql(upsert: bool) -> String {
    let columns: Vec<String> = RECORD_COLUMNS.iter().map(|c| format!("`{}`", c)).collect();
    let placeholders = vec!["?"; RECORD_COLUMNS.len()].join(", ");
    let mut sql = format!(
        "INSERT INTO `{}` ({}) VALUES ({})",
        RECORDS_TABLE,
        columns.join(", "),
        placeholders
    );
    if upsert {
        let updates: Vec<String> = RECORD_COLUMNS[1..]
            .iter()
            .map(|c| format!("`{c}` = VALUES(`{c}`)"))
            .collect();
        sql.push_str(" ON DUPLICATE KEY UPDATE ");
        sql.push_str(&updates.join(", "));
    }
    sql
}

/// Escape LIKE wildcards so the needle matches literally
fn like_pattern(needle: &str) -> String {
    let escaped = needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

fn record_from_row(row: &MySqlRow) -> Result<Record> {
    let id: String = row.try_get("id")?;
    let id = Uuid::parse_str(&id)
        .map_err(|e| Error::QueryExecution(format!("invalid record id '{}': {}", id, e)))?;

    Ok(Record {
        id: Some(id),
        name: row.try_get("name")?,
        year: row.try_get("year")?,
        rank: row.try_get("rank")?,
        actor1_first_name: row.try_get("actor1_first_name")?,
        actor1_last_name: row.try_get("actor1_last_name")?,
        actor2_first_name: row.try_get("actor2_first_name")?,
        actor2_last_name: row.try_get("actor2_last_name")?,
        actor3_first_name: row.try_get("actor3_first_name")?,
        actor3_last_name: row.try_get("actor3_last_name")?,
    })
}

fn wal_from_row(row: &MySqlRow) -> Result<WalEntry> {
    Ok(WalEntry {
        id: row.try_get("id")?,
        operation: row.try_get("operation")?,
        node: row.try_get("node")?,
        value: row.try_get("value")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
    })
}

impl MySqlSession {
    fn conn(&mut self) -> Result<&mut MySqlConnection> {
        let role = self.role;
        self.conn
            .as_deref_mut()
            .ok_or_else(|| Error::Network(format!("{} session was discarded", role)))
    }

    async fn write_record(&mut self, sql: &str, record: &Record) -> Result<u64> {
        let id = record.require_id()?.to_string();
        let query = sqlx::query(sql)
            .bind(id)
            .bind(&record.name)
            .bind(record.year)
            .bind(record.rank)
            .bind(&record.actor1_first_name)
            .bind(&record.actor1_last_name)
            .bind(&record.actor2_first_name)
            .bind(&record.actor2_last_name)
            .bind(&record.actor3_first_name)
            .bind(&record.actor3_last_name);

        let result = query.execute(self.conn()?).await?;
        Ok(result.rows_affected())
    }

    async fn append_wal(&mut self, entry: &NewWalEntry) -> Result<u64> {
        let sql = format!(
            "INSERT INTO `{}` (`operation`, `node`, `value`, `active`) VALUES (?, ?, ?, 1)",
            WAL_TABLE
        );
        let result = sqlx::query(&sql)
            .bind(entry.operation.as_str())
            .bind(entry.node.as_str())
            .bind(&entry.value)
            .execute(self.conn()?)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl NodeSession for MySqlSession {
    async fn execute(&mut self, statement: &Statement) -> Result<u64> {
        tracing::debug!("{} node: {}", self.role, statement.label());

        if let Some(sql) = statement.control_sql() {
            if let Some(xid) = statement.xid() {
                validate_xid(xid)?;
            }
            let result = self.conn()?.execute(sql.as_str()).await?;
            return Ok(result.rows_affected());
        }

        match statement {
            Statement::InsertRecord(record) => {
                self.write_record(&insert_sql(false), record).await
            }
            Statement::UpsertRecord(record) => {
                self.write_record(&insert_sql(true), record).await
            }
            Statement::DeleteRecord(id) => {
                let sql = format!("DELETE FROM `{}` WHERE `id` = ?", RECORDS_TABLE);
                let result = sqlx::query(&sql)
                    .bind(id.to_string())
                    .execute(self.conn()?)
                    .await?;
                Ok(result.rows_affected())
            }
            Statement::AppendWal(entry) => self.append_wal(entry).await,
            Statement::DeactivateWal(id) => {
                let sql = format!(
                    "UPDATE `{}` SET `active` = 0 WHERE `id` = ? AND `active` = 1",
                    WAL_TABLE
                );
                let result = sqlx::query(&sql)
                    .bind(*id)
                    .execute(self.conn()?)
                    .await?;
                Ok(result.rows_affected())
            }
            other => Err(Error::QueryExecution(format!(
                "statement {} has no SQL form",
                other.label()
            ))),
        }
    }

    async fn fetch_records(&mut self, query: &RecordQuery) -> Result<Vec<Record>> {
        let select = format!("SELECT * FROM `{}`", RECORDS_TABLE);
        let rows = match query {
            RecordQuery::ById(id) => {
                sqlx::query(&format!("{} WHERE `id` = ?", select))
                    .bind(id.to_string())
                    .fetch_all(self.conn()?)
                    .await?
            }
            RecordQuery::All { limit } => {
                sqlx::query(&format!("{} ORDER BY `name` LIMIT ?", select))
                    .bind(*limit)
                    .fetch_all(self.conn()?)
                    .await?
            }
            RecordQuery::NameContains { needle, limit } => {
                sqlx::query(&format!("{} WHERE `name` LIKE ? ORDER BY `name` LIMIT ?", select))
                    .bind(like_pattern(needle))
                    .bind(*limit)
                    .fetch_all(self.conn()?)
                    .await?
            }
        };

        rows.iter().map(record_from_row).collect()
    }

    async fn fetch_active_wal(&mut self) -> Result<Vec<WalEntry>> {
        let sql = format!(
            "SELECT `id`, `operation`, `node`, `value`, `active`, `created_at` FROM `{}` \
             WHERE `active` = 1 ORDER BY `id`",
            WAL_TABLE
        );
        let rows = sqlx::query(&sql).fetch_all(self.conn()?).await?;
        rows.iter().map(wal_from_row).collect()
    }

    async fn aggregate_rank(&mut self, aggregate: RankAggregate) -> Result<Option<f64>> {
        // `* 1E0` forces a DOUBLE result for every aggregate function
        let sql = format!(
            "SELECT {}(`rank`) * 1E0 AS value FROM `{}`",
            aggregate.sql_function(),
            RECORDS_TABLE
        );
        let row = sqlx::query(&sql).fetch_one(self.conn()?).await?;
        Ok(row.try_get("value")?)
    }

    async fn discard(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.detach().close().await {
                tracing::warn!("Closing discarded {} connection failed: {}", self.role, e);
            }
        }
    }
}
