//! Two-Phase Branch
//!
//! Applies a batch of mutations to one node as a single XA branch. The
//! branch is driven in two stages so a coordinator can prepare every node
//! before committing any of them: `prepare_branch` runs start, mutate, end
//! and prepare; `commit_branch` or `rollback_branch` finishes it.

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::node::{NodeRole, NodeSession, Statement};
use crate::record::IsolationLevel;

/// A branch that reached `XA PREPARE` and awaits commit or rollback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedBranch {
    pub role: NodeRole,
    pub xid: String,
    /// Rows affected by the branch's statements
    pub affected: u64,
}

/// Start, mutate, end and prepare `statements` as one XA branch.
///
/// Any failure after `XA START` rolls the branch back before the error is
/// returned, so on `Err` nothing of the branch survives on the node.
pub async fn prepare_branch(
    role: NodeRole,
    session: &mut dyn NodeSession,
    isolation: Option<IsolationLevel>,
    statements: &[Statement],
) -> Result<PreparedBranch> {
    let xid = Uuid::new_v4().to_string();

    if let Some(level) = isolation {
        session
            .execute(&Statement::SetIsolationLevel(level))
            .await
            .map_err(|e| Error::transaction(role, e))?;
    }

    session
        .execute(&Statement::XaStart(xid.clone()))
        .await
        .map_err(|e| Error::transaction(role, e))?;

    let mut ended = false;
    let mut affected = 0u64;
    let outcome: Result<()> = async {
        for statement in statements {
            affected += session.execute(statement).await?;
        }
        session.execute(&Statement::XaEnd(xid.clone())).await?;
        ended = true;
        session.execute(&Statement::XaPrepare(xid.clone())).await?;
        Ok(())
    }
    .await;

    match outcome {
        Ok(()) => {
            tracing::debug!("Prepared branch {} on {} node ({} rows)", xid, role, affected);
            Ok(PreparedBranch { role, xid, affected })
        }
        Err(e) => {
            tracing::warn!("Branch {} on {} node failed, rolling back: {}", xid, role, e);
            rollback(role, session, &xid, ended).await;
            Err(Error::transaction(role, e))
        }
    }
}

/// Commit a prepared branch. A failed commit is followed by a rollback
/// attempt so the branch does not stay prepared on the node.
pub async fn commit_branch(session: &mut dyn NodeSession, branch: &PreparedBranch) -> Result<u64> {
    match session.execute(&Statement::XaCommit(branch.xid.clone())).await {
        Ok(_) => {
            tracing::debug!("Committed branch {} on {} node", branch.xid, branch.role);
            Ok(branch.affected)
        }
        Err(e) => {
            tracing::warn!("XA COMMIT of {} failed on {} node: {}", branch.xid, branch.role, e);
            rollback(branch.role, session, &branch.xid, true).await;
            Err(Error::transaction(branch.role, e))
        }
    }
}

/// Roll back a prepared branch whose siblings could not all prepare
pub async fn rollback_branch(session: &mut dyn NodeSession, branch: &PreparedBranch) {
    tracing::info!("Rolling back prepared branch {} on {} node", branch.xid, branch.role);
    rollback(branch.role, session, &branch.xid, true).await;
}

/// Run `statements` on `session` as one XA branch, prepare then commit.
///
/// Returns the rows affected by the statements. The branch is either
/// committed in full or rolled back.
pub async fn run_branch(
    role: NodeRole,
    session: &mut dyn NodeSession,
    isolation: Option<IsolationLevel>,
    statements: &[Statement],
) -> Result<u64> {
    let prepared = prepare_branch(role, session, isolation, statements).await?;
    commit_branch(session, &prepared).await
}

/// Best-effort compensation; the triggering error is what the caller sees.
///
/// A session whose rollback fails may still hold the branch open, so it is
/// discarded instead of going back to the pool.
async fn rollback(role: NodeRole, session: &mut dyn NodeSession, xid: &str, ended: bool) {
    if !ended {
        if let Err(e) = session.execute(&Statement::XaEnd(xid.to_string())).await {
            tracing::warn!("XA END during rollback failed on {} node: {}", role, e);
        }
    }
    if let Err(e) = session.execute(&Statement::XaRollback(xid.to_string())).await {
        tracing::error!("XA ROLLBACK of {} failed on {} node, discarding connection: {}", xid, role, e);
        session.discard().await;
    }
}
