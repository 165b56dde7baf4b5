//! In-Memory Node
//!
//! A node backend that keeps its tables in memory. Used in tests and local
//! experiments: reachability can be toggled, connection attempts can be made
//! to fail or hang, and a failure can be injected on a chosen statement.
//!
//! XA branches are staged per session and applied to the shared tables on
//! `XA COMMIT`; a rolled back branch leaves no trace.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{NodeBackend, NodeRole, NodeSession, RankAggregate, RecordQuery, Statement};
use crate::error::{Error, Result};
use crate::record::Record;
use crate::wal::WalEntry;

/// Committed tables of a memory node
#[derive(Debug, Default)]
struct Tables {
    records: BTreeMap<Uuid, Record>,
    wal: Vec<WalEntry>,
    /// Labels of every statement executed, in order
    history: Vec<String>,
}

impl Tables {
    fn apply(&mut self, statement: &Statement) -> Result<u64> {
        match statement {
            Statement::InsertRecord(record) => {
                let id = record.require_id()?;
                if self.records.contains_key(&id) {
                    return Err(Error::QueryExecution(format!("Duplicate entry '{}' for key 'PRIMARY'", id)));
                }
                self.records.insert(id, record.clone());
                Ok(1)
            }
            Statement::UpsertRecord(record) => {
                let id = record.require_id()?;
                match self.records.insert(id, record.clone()) {
                    None => Ok(1),
                    Some(previous) if previous == *record => Ok(0),
                    Some(_) => Ok(2),
                }
            }
            Statement::DeleteRecord(id) => Ok(self.records.remove(id).map_or(0, |_| 1)),
            Statement::AppendWal(entry) => {
                self.wal.push(WalEntry {
                    id: self.wal.len() as u64 + 1,
                    operation: entry.operation.as_str().to_string(),
                    node: entry.node.as_str().to_string(),
                    value: entry.value.clone(),
                    active: true,
                    created_at: Utc::now(),
                });
                Ok(1)
            }
            Statement::DeactivateWal(id) => {
                match self.wal.iter_mut().find(|e| e.id == *id && e.active) {
                    Some(entry) => {
                        entry.active = false;
                        Ok(1)
                    }
                    None => Ok(0),
                }
            }
            _ => Ok(0),
        }
    }

    /// Rows a staged statement would touch if committed now
    fn would_affect(&self, statement: &Statement) -> Result<u64> {
        match statement {
            Statement::InsertRecord(record) => {
                let id = record.require_id()?;
                if self.records.contains_key(&id) {
                    return Err(Error::QueryExecution(format!("Duplicate entry '{}' for key 'PRIMARY'", id)));
                }
                Ok(1)
            }
            Statement::UpsertRecord(_) | Statement::AppendWal(_) => Ok(1),
            Statement::DeleteRecord(id) => Ok(u64::from(self.records.contains_key(id))),
            _ => Ok(0),
        }
    }
}

/// Where an XA branch is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchState {
    Active,
    Idle,
    Prepared,
}

#[derive(Debug)]
struct Branch {
    xid: String,
    state: BranchState,
    staged: Vec<Statement>,
}

/// Shared state between a memory node and its sessions
#[derive(Debug, Default)]
struct Shared {
    tables: Mutex<Tables>,
    reachable: AtomicBool,
    hanging: AtomicBool,
    closed: AtomicBool,
    failing_connects: AtomicU32,
    connect_attempts: AtomicU32,
    leased: AtomicUsize,
    discarded: AtomicUsize,
    /// Label of a statement that fails the next time it runs
    fail_on: Mutex<Option<String>>,
}

impl Shared {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// An in-memory node
pub struct MemoryNode {
    role: NodeRole,
    shared: Arc<Shared>,
}

impl MemoryNode {
    pub fn new(role: NodeRole) -> Arc<Self> {
        let shared = Shared {
            reachable: AtomicBool::new(true),
            ..Default::default()
        };
        Arc::new(Self {
            role,
            shared: Arc::new(shared),
        })
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Refuse (false) or accept (true) new connections
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make connection attempts never complete
    pub fn set_hanging(&self, hanging: bool) {
        self.shared.hanging.store(hanging, Ordering::SeqCst);
    }

    /// Fail the next `count` connection attempts
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Fail the next statement whose label matches, e.g. "XA PREPARE"
    pub fn fail_on(&self, label: &str) {
        *self.shared.fail_on.lock().unwrap_or_else(|p| p.into_inner()) = Some(label.to_string());
    }

    pub fn connect_attempts(&self) -> u32 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Sessions currently leased
    pub fn leased(&self) -> usize {
        self.shared.leased.load(Ordering::SeqCst)
    }

    /// Sessions closed through `discard` rather than released
    pub fn discarded(&self) -> usize {
        self.shared.discarded.load(Ordering::SeqCst)
    }

    pub fn record(&self, id: Uuid) -> Option<Record> {
        self.shared.tables().records.get(&id).cloned()
    }

    pub fn records(&self) -> Vec<Record> {
        self.shared.tables().records.values().cloned().collect()
    }

    /// Insert a record directly, bypassing any coordinator
    pub fn seed(&self, record: Record) -> Result<()> {
        self.shared.tables().apply(&Statement::InsertRecord(record)).map(|_| ())
    }

    /// Every WAL entry, active or not
    pub fn wal(&self) -> Vec<WalEntry> {
        self.shared.tables().wal.clone()
    }

    pub fn active_wal(&self) -> Vec<WalEntry> {
        self.shared.tables().wal.iter().filter(|e| e.active).cloned().collect()
    }

    /// Labels of executed statements, in order
    pub fn history(&self) -> Vec<String> {
        self.shared.tables().history.clone()
    }
}

#[async_trait]
impl NodeBackend for MemoryNode {
    async fn connect(&self) -> Result<Box<dyn NodeSession>> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if self.shared.hanging.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }

        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Network(format!("{} pool is closed", self.role)));
        }

        if !self.shared.reachable.load(Ordering::SeqCst) {
            return Err(Error::Network(format!("{} node refused connection", self.role)));
        }

        let failing = self.shared.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.shared.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(Error::Network(format!("{} node reset connection", self.role)));
        }

        self.shared.leased.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            role: self.role,
            shared: Arc::clone(&self.shared),
            branch: None,
            discarded: false,
        }))
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

struct MemorySession {
    role: NodeRole,
    shared: Arc<Shared>,
    branch: Option<Branch>,
    discarded: bool,
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.shared.leased.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemorySession {
    fn check_injected_failure(&self, label: &str) -> Result<()> {
        if self.discarded {
            return Err(Error::Network(format!("{} session was discarded", self.role)));
        }
        let mut fail_on = self.shared.fail_on.lock().unwrap_or_else(|p| p.into_inner());
        if fail_on.as_deref() == Some(label) {
            *fail_on = None;
            return Err(Error::QueryExecution(format!("injected failure on {} at {} node", label, self.role)));
        }
        Ok(())
    }

    fn branch_in(&mut self, xid: &str, expected: &[BranchState]) -> Result<&mut Branch> {
        let role = self.role;
        match self.branch.as_mut() {
            Some(branch) if branch.xid == xid && expected.contains(&branch.state) => Ok(branch),
            Some(branch) => Err(Error::QueryExecution(format!(
                "XAER_RMFAIL: branch {} on {} node is {:?}",
                branch.xid, role, branch.state
            ))),
            None => Err(Error::QueryExecution(format!("XAER_NOTA: unknown xid {} on {} node", xid, role))),
        }
    }

    fn run(&mut self, statement: &Statement) -> Result<u64> {
        match statement {
            Statement::XaStart(xid) => {
                if self.branch.is_some() {
                    return Err(Error::QueryExecution("XAER_OUTSIDE: a branch is already open".into()));
                }
                self.branch = Some(Branch {
                    xid: xid.clone(),
                    state: BranchState::Active,
                    staged: Vec::new(),
                });
                Ok(0)
            }
            Statement::XaEnd(xid) => {
                self.branch_in(xid, &[BranchState::Active])?.state = BranchState::Idle;
                Ok(0)
            }
            Statement::XaPrepare(xid) => {
                self.branch_in(xid, &[BranchState::Idle])?.state = BranchState::Prepared;
                Ok(0)
            }
            Statement::XaCommit(xid) => {
                self.branch_in(xid, &[BranchState::Prepared])?;
                if let Some(branch) = self.branch.take() {
                    let mut tables = self.shared.tables();
                    for staged in &branch.staged {
                        tables.apply(staged)?;
                    }
                }
                Ok(0)
            }
            Statement::XaRollback(xid) => {
                self.branch_in(xid, &[BranchState::Idle, BranchState::Prepared])?;
                self.branch = None;
                Ok(0)
            }
            statement if statement.is_mutation() => match self.branch.as_mut() {
                Some(branch) if branch.state == BranchState::Active => {
                    let affected = self.shared.tables().would_affect(statement)?;
                    branch.staged.push(statement.clone());
                    Ok(affected)
                }
                Some(branch) => Err(Error::QueryExecution(format!(
                    "XAER_RMFAIL: branch {} is {:?}",
                    branch.xid, branch.state
                ))),
                None => self.shared.tables().apply(statement),
            },
            other => self.shared.tables().apply(other),
        }
    }
}

#[async_trait]
impl NodeSession for MemorySession {
    async fn execute(&mut self, statement: &Statement) -> Result<u64> {
        let label = statement.label();
        self.shared.tables().history.push(label.clone());
        self.check_injected_failure(&label)?;
        self.run(statement)
    }

    async fn fetch_records(&mut self, query: &RecordQuery) -> Result<Vec<Record>> {
        self.check_injected_failure("SELECT records")?;
        let tables = self.shared.tables();
        let mut found: Vec<Record> = tables
            .records
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found.truncate(query.limit() as usize);
        Ok(found)
    }

    async fn fetch_active_wal(&mut self) -> Result<Vec<WalEntry>> {
        self.check_injected_failure("SELECT wal_entries")?;
        Ok(self.shared.tables().wal.iter().filter(|e| e.active).cloned().collect())
    }

    async fn aggregate_rank(&mut self, aggregate: RankAggregate) -> Result<Option<f64>> {
        self.check_injected_failure("SELECT records")?;
        let tables = self.shared.tables();
        Ok(aggregate.apply(tables.records.values().map(|r| r.rank)))
    }

    async fn discard(&mut self) {
        if !self.discarded {
            self.discarded = true;
            // A closed connection takes its open branch with it
            self.branch = None;
            self.shared.discarded.fetch_add(1, Ordering::SeqCst);
        }
    }
}
