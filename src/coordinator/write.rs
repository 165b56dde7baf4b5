//! Write Coordinator
//!
//! Applies create, update and delete to every target node that can be
//! reached. Unreachable targets are owed the write through a WAL entry
//! committed inside a reachable sibling's branch.
//!
//! Every reachable target is prepared before any of them commits: if one
//! branch fails to prepare, the prepared siblings are rolled back and the
//! write fails as a whole.

use std::sync::Arc;

use futures::future::join_all;
use uuid::Uuid;

use super::branch::{commit_branch, prepare_branch, rollback_branch, run_branch, PreparedBranch};
use crate::error::{Error, Result};
use crate::node::{Acquired, NodeRegistry, NodeRole, NodeSession, RetryPolicy, Statement};
use crate::record::{IsolationLevel, Record};
use crate::shard::ShardRouter;
use crate::wal::{NewWalEntry, WalOperation};

/// What one node must do for a write
struct Plan {
    role: NodeRole,
    mutation: Statement,
    /// Entry logged on a sibling if the node cannot be reached
    owed: NewWalEntry,
    /// The write fails unless at least one holder of the record is reachable
    holder: bool,
}

impl Plan {
    fn holding(role: NodeRole, mutation: Statement, owed: NewWalEntry) -> Self {
        Self {
            role,
            mutation,
            owed,
            holder: true,
        }
    }
}

/// One reachable target and the statements its branch will run
struct Target {
    role: NodeRole,
    session: Box<dyn NodeSession>,
    statements: Vec<Statement>,
    owed: NewWalEntry,
}

impl Target {
    fn appended(&self) -> u64 {
        self.statements
            .iter()
            .filter(|s| matches!(s, Statement::AppendWal(_)))
            .count() as u64
    }
}

/// Result of fanning a write out to its targets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct FanOut {
    /// Nodes whose branch committed
    applied: Vec<NodeRole>,
    /// Nodes owed the write through the WAL
    deferred: Vec<NodeRole>,
    /// Rows the mutation touched across applied nodes
    rows_affected: u64,
}

/// Coordinates writes across the central node and the partitions
pub struct WriteCoordinator {
    registry: Arc<NodeRegistry>,
    router: ShardRouter,
    policy: RetryPolicy,
}

impl WriteCoordinator {
    pub fn new(registry: Arc<NodeRegistry>, router: ShardRouter, policy: RetryPolicy) -> Self {
        Self {
            registry,
            router,
            policy,
        }
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    /// Insert a new record, assigning its id
    pub async fn create(&self, record: Record, isolation: IsolationLevel) -> Result<Record> {
        if record.id.is_some() {
            return Err(Error::Validation("id is assigned on create and must be omitted".into()));
        }
        record.validate()?;

        let mut record = record;
        record.id = Some(Uuid::new_v4());

        let (central, partition) = self.router.route(&record);
        let mut plans = Vec::with_capacity(2);
        for role in [central, partition] {
            plans.push(Plan::holding(
                role,
                Statement::InsertRecord(record.clone()),
                NewWalEntry::for_record(WalOperation::Insert, role, &record)?,
            ));
        }
        let fan_out = self.fan_out("create", plans, isolation).await?;

        tracing::info!(
            "Created record {} on {:?} (deferred: {:?})",
            record.require_id()?,
            fan_out.applied,
            fan_out.deferred
        );
        Ok(record)
    }

    /// Overwrite a record by id.
    ///
    /// The new year may move the record across the cutoff, so the central
    /// node and the owning partition receive an upsert and the other
    /// partition a delete-if-exists.
    pub async fn update(&self, record: Record, isolation: IsolationLevel) -> Result<Record> {
        let id = record.require_id()?;
        record.validate()?;

        let (central, owner) = self.router.route(&record);
        let mut plans = Vec::with_capacity(3);
        for role in [central, owner] {
            plans.push(Plan::holding(
                role,
                Statement::UpsertRecord(record.clone()),
                NewWalEntry::for_record(WalOperation::Update, role, &record)?,
            ));
        }
        let stale = self.router.non_owner(record.year);
        plans.push(Plan {
            role: stale,
            mutation: Statement::DeleteRecord(id),
            owed: NewWalEntry::for_delete(stale, id)?,
            holder: false,
        });
        let fan_out = self.fan_out("update", plans, isolation).await?;

        tracing::info!(
            "Updated record {} on {:?} (deferred: {:?})",
            id,
            fan_out.applied,
            fan_out.deferred
        );
        Ok(record)
    }

    /// Delete a record by id from every node.
    ///
    /// The owning partition is unknown without a lookup, so the delete goes
    /// to all nodes as delete-if-exists. Returns whether any node removed a
    /// row or a delete was deferred to an unreachable node.
    pub async fn delete(&self, id: Uuid, isolation: IsolationLevel) -> Result<bool> {
        let mut plans = Vec::with_capacity(NodeRole::ALL.len());
        for role in NodeRole::ALL {
            plans.push(Plan::holding(role, Statement::DeleteRecord(id), NewWalEntry::for_delete(role, id)?));
        }
        let fan_out = self.fan_out("delete", plans, isolation).await?;

        tracing::info!(
            "Deleted record {} ({} rows on {:?}, deferred: {:?})",
            id,
            fan_out.rows_affected,
            fan_out.applied,
            fan_out.deferred
        );
        Ok(fan_out.rows_affected > 0 || !fan_out.deferred.is_empty())
    }

    /// Acquire every target, prepare the mutation on each reachable one with
    /// the WAL entries for unreachable targets attached to the first
    /// reachable holder, then commit only once every branch has prepared.
    async fn fan_out(&self, operation: &str, plans: Vec<Plan>, isolation: IsolationLevel) -> Result<FanOut> {
        let acquired = join_all(
            plans
                .iter()
                .map(|plan| self.registry.acquire(plan.role, &self.policy)),
        )
        .await;

        let mut reachable = Vec::new();
        let mut unreachable = Vec::new();
        let mut carrier = None;
        for (plan, outcome) in plans.into_iter().zip(acquired) {
            match outcome {
                Acquired::Connected(session) => {
                    if plan.holder && carrier.is_none() {
                        carrier = Some(reachable.len());
                    }
                    reachable.push(Target {
                        role: plan.role,
                        session,
                        statements: vec![plan.mutation],
                        owed: plan.owed,
                    });
                }
                Acquired::Unavailable => unreachable.push((plan.role, plan.owed)),
            }
        }

        let Some(carrier) = carrier else {
            let roles: Vec<NodeRole> = unreachable.iter().map(|(role, _)| *role).collect();
            tracing::error!("{}: none of {:?} reachable", operation, roles);
            return Err(Error::NodeUnavailable {
                operation: operation.to_string(),
            });
        };

        for (role, owed) in &unreachable {
            tracing::warn!(
                "{} node unreachable for {}, logging to WAL on {} node",
                role,
                operation,
                reachable[carrier].role
            );
            reachable[carrier].statements.push(Statement::AppendWal(owed.clone()));
        }

        // Phase one: every branch prepares, or none of them commits
        let prepared = join_all(reachable.iter_mut().map(|target| {
            prepare_branch(
                target.role,
                target.session.as_mut(),
                Some(isolation),
                &target.statements,
            )
        }))
        .await;

        let mut branches = Vec::with_capacity(prepared.len());
        let mut failure = None;
        for outcome in prepared {
            match outcome {
                Ok(branch) => branches.push(Some(branch)),
                Err(e) => {
                    failure.get_or_insert(e);
                    branches.push(None);
                }
            }
        }

        if let Some(e) = failure {
            join_all(reachable.iter_mut().zip(&branches).filter_map(|(target, branch)| {
                let branch = branch.as_ref()?;
                Some(rollback_branch(target.session.as_mut(), branch))
            }))
            .await;
            tracing::error!("{} aborted before commit: {}", operation, e);
            return Err(e);
        }
        let prepared: Vec<PreparedBranch> = branches.into_iter().flatten().collect();

        // Phase two
        let committed = join_all(
            reachable
                .iter_mut()
                .zip(&prepared)
                .map(|(target, branch)| commit_branch(target.session.as_mut(), branch)),
        )
        .await;

        let mut fan_out = FanOut {
            deferred: unreachable.iter().map(|(role, _)| *role).collect(),
            ..Default::default()
        };
        let mut lost = Vec::new();
        let mut first_error = None;
        for (index, result) in committed.into_iter().enumerate() {
            let target = &reachable[index];
            match result {
                Ok(rows) => {
                    fan_out.applied.push(target.role);
                    // WAL appends are counted by the carrier's branch too
                    fan_out.rows_affected += rows.saturating_sub(target.appended());
                }
                Err(e) => {
                    tracing::error!("{} failed to commit on {} node: {}", operation, target.role, e);
                    lost.push(target.owed.clone());
                    if index == carrier {
                        // The entries for unreachable targets went down with this branch
                        lost.extend(unreachable.iter().map(|(_, owed)| owed.clone()));
                    }
                    first_error.get_or_insert(e);
                }
            }
        }

        let Some(error) = first_error else {
            return Ok(fan_out);
        };
        if fan_out.applied.is_empty() {
            return Err(error);
        }

        // Some branches committed: owe the rest through a fresh branch on one of them
        let Some(keeper) = reachable.iter_mut().find(|t| fan_out.applied.contains(&t.role)) else {
            return Err(error);
        };
        let entries: Vec<Statement> = lost.iter().cloned().map(Statement::AppendWal).collect();
        run_branch(keeper.role, keeper.session.as_mut(), None, &entries).await?;
        tracing::warn!(
            "{} committed on {:?}; {} WAL entries logged on {} node after failed commits",
            operation,
            fan_out.applied,
            entries.len(),
            keeper.role
        );
        for owed in lost {
            if !fan_out.deferred.contains(&owed.node) {
                fan_out.deferred.push(owed.node);
            }
        }
        Ok(fan_out)
    }
}
