//! Recovery Manager
//!
//! Drains active WAL entries: each entry is replayed on the node it is owed
//! to and then deactivated on the node that holds it. Entries are never
//! deleted.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::coordinator::run_branch;
use crate::error::Error;
use crate::node::{NodeRegistry, NodeRole, NodeSession, RetryPolicy, Statement};
use crate::wal::WalEntry;

/// Outcome of one recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Entries replayed and deactivated by this pass
    pub replayed: u64,
    /// Entries left active because their target was unreachable
    pub skipped: u64,
    /// Entries left active because they were malformed or replay failed
    pub failed: u64,
    /// Entries replayed but deactivated concurrently by another pass
    pub already_claimed: u64,
    /// Nodes whose WAL could not be read
    pub unreachable_origins: Vec<NodeRole>,
}

impl RecoveryReport {
    fn merge(&mut self, other: RecoveryReport) {
        self.replayed += other.replayed;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.already_claimed += other.already_claimed;
        self.unreachable_origins.extend(other.unreachable_origins);
    }

    /// Whether every WAL was read and nothing was left behind
    pub fn is_clean(&self) -> bool {
        self.skipped == 0 && self.failed == 0 && self.unreachable_origins.is_empty()
    }
}

enum Outcome {
    Replayed,
    Skipped,
    Failed,
    AlreadyClaimed,
}

type TargetSessions = HashMap<NodeRole, Option<Box<dyn NodeSession>>>;

pub struct RecoveryManager {
    registry: Arc<NodeRegistry>,
    policy: RetryPolicy,
    /// Serializes passes started from this process
    pass: Mutex<()>,
}

impl RecoveryManager {
    pub fn new(registry: Arc<NodeRegistry>, policy: RetryPolicy) -> Self {
        Self {
            registry,
            policy,
            pass: Mutex::new(()),
        }
    }

    /// Run one pass over every node's WAL
    pub async fn recover(&self) -> RecoveryReport {
        let _pass = self.pass.lock().await;

        let reports = join_all(NodeRole::ALL.iter().map(|origin| self.recover_origin(*origin))).await;

        let mut report = RecoveryReport::default();
        for origin_report in reports {
            report.merge(origin_report);
        }

        if report.replayed > 0 || !report.is_clean() {
            tracing::info!(
                "Recovery pass: {} replayed, {} skipped, {} failed, {} already claimed, unreachable: {:?}",
                report.replayed,
                report.skipped,
                report.failed,
                report.already_claimed,
                report.unreachable_origins
            );
        } else {
            tracing::debug!("Recovery pass: nothing to replay");
        }
        report
    }

    async fn recover_origin(&self, origin: NodeRole) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        let Some(mut session) = self.registry.acquire(origin, &self.policy).await.into_session() else {
            tracing::warn!("{}", Error::RecoveryNodeUnavailable(origin));
            report.unreachable_origins.push(origin);
            return report;
        };

        let entries = match session.fetch_active_wal().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Failed to read WAL on {} node: {}", origin, e);
                report.unreachable_origins.push(origin);
                return report;
            }
        };

        if entries.is_empty() {
            return report;
        }
        tracing::info!("{} active WAL entries on {} node", entries.len(), origin);

        // Entries are applied in id order so later writes win
        let mut targets = TargetSessions::new();
        for entry in &entries {
            match self.replay_entry(origin, session.as_mut(), entry, &mut targets).await {
                Outcome::Replayed => report.replayed += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Failed => report.failed += 1,
                Outcome::AlreadyClaimed => report.already_claimed += 1,
            }
        }
        report
    }

    async fn replay_entry(
        &self,
        origin: NodeRole,
        origin_session: &mut dyn NodeSession,
        entry: &WalEntry,
        targets: &mut TargetSessions,
    ) -> Outcome {
        let (target, statement) = match entry.target().and_then(|t| Ok((t, entry.replay_statement()?))) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::error!("Skipping WAL entry {} on {} node: {}", entry.id, origin, e);
                return Outcome::Failed;
            }
        };

        if target == origin {
            tracing::error!("WAL entry {} on {} node targets its own node", entry.id, origin);
            return Outcome::Failed;
        }

        if !targets.contains_key(&target) {
            let session = self.registry.acquire(target, &self.policy).await.into_session();
            targets.insert(target, session);
        }
        let Some(Some(target_session)) = targets.get_mut(&target) else {
            tracing::warn!("WAL entry {} left active: {}", entry.id, Error::RecoveryNodeUnavailable(target));
            return Outcome::Skipped;
        };

        if let Err(e) = run_branch(target, &mut **target_session, None, std::slice::from_ref(&statement)).await {
            tracing::error!("Replay of WAL entry {} to {} node failed: {}", entry.id, target, e);
            return Outcome::Failed;
        }

        match origin_session.execute(&Statement::DeactivateWal(entry.id)).await {
            Ok(0) => {
                tracing::debug!("WAL entry {} on {} node already claimed", entry.id, origin);
                Outcome::AlreadyClaimed
            }
            Ok(_) => {
                tracing::debug!("Replayed WAL entry {} ({}) from {} to {}", entry.id, entry.operation, origin, target);
                Outcome::Replayed
            }
            Err(e) => {
                // Replay is idempotent, so the next pass re-applies it
                tracing::error!("Failed to deactivate WAL entry {} on {} node: {}", entry.id, origin, e);
                Outcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::WriteCoordinator;
    use crate::node::memory::MemoryNode;
    use crate::record::{IsolationLevel, Record};
    use crate::shard::ShardRouter;
    use crate::wal::{NewWalEntry, WalOperation};
    use crate::node::NodeBackend;

    struct Fixture {
        central: Arc<MemoryNode>,
        before: Arc<MemoryNode>,
        after: Arc<MemoryNode>,
        writer: WriteCoordinator,
        recovery: RecoveryManager,
    }

    fn fixture() -> Fixture {
        let central = MemoryNode::new(NodeRole::Central);
        let before = MemoryNode::new(NodeRole::BeforeCutoff);
        let after = MemoryNode::new(NodeRole::AfterCutoff);
        let registry = Arc::new(NodeRegistry::from_backends(
            central.clone(),
            before.clone(),
            after.clone(),
        ));
        Fixture {
            central,
            before,
            after,
            writer: WriteCoordinator::new(Arc::clone(&registry), ShardRouter::new(1980), RetryPolicy::immediate(1)),
            recovery: RecoveryManager::new(registry, RetryPolicy::immediate(1)),
        }
    }

    async fn create_while_down(f: &Fixture, node: &MemoryNode, record: Record) -> Record {
        node.set_reachable(false);
        let created = f.writer.create(record, IsolationLevel::default()).await.unwrap();
        node.set_reachable(true);
        created
    }

    #[tokio::test]
    async fn test_replay_then_deactivate() {
        let f = fixture();
        let created = create_while_down(&f, &f.before, Record::new("X", 1975)).await;
        let id = created.id.unwrap();
        assert!(f.before.record(id).is_none());

        let report = f.recovery.recover().await;

        assert_eq!(report.replayed, 1);
        assert!(report.is_clean());
        assert_eq!(f.before.record(id), Some(created));
        assert!(f.central.active_wal().is_empty());
        // Kept for audit
        assert_eq!(f.central.wal().len(), 1);
    }

    #[tokio::test]
    async fn test_second_pass_is_noop() {
        let f = fixture();
        create_while_down(&f, &f.after, Record::new("Melanie Darrow", 1997)).await;

        assert_eq!(f.recovery.recover().await.replayed, 1);
        let second = f.recovery.recover().await;

        assert_eq!(second, RecoveryReport::default());
        assert_eq!(f.after.records().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_target_stays_active() {
        let f = fixture();
        f.before.set_reachable(false);
        f.writer.create(Record::new("X", 1975), IsolationLevel::default()).await.unwrap();

        let report = f.recovery.recover().await;

        assert_eq!(report.skipped, 1);
        assert_eq!(report.unreachable_origins, vec![NodeRole::BeforeCutoff]);
        assert_eq!(f.central.active_wal().len(), 1);
    }

    #[tokio::test]
    async fn test_entries_replay_in_order() {
        let f = fixture();
        let created = create_while_down(&f, &f.after, Record::new("Melanios letzte Liebe", 1991)).await;

        f.after.set_reachable(false);
        let mut changed = created.clone();
        changed.rank = Some(6.4);
        f.writer.update(changed.clone(), IsolationLevel::default()).await.unwrap();
        f.after.set_reachable(true);

        let report = f.recovery.recover().await;

        assert_eq!(report.replayed, 2);
        assert_eq!(f.after.record(created.id.unwrap()), Some(changed));
    }

    #[tokio::test]
    async fn test_moved_record_leaves_old_partition_after_recovery() {
        let f = fixture();
        let created = f.writer.create(Record::new("X", 1975), IsolationLevel::default()).await.unwrap();
        let id = created.id.unwrap();

        f.before.set_reachable(false);
        let mut moved = created.clone();
        moved.year = 1990;
        f.writer.update(moved.clone(), IsolationLevel::default()).await.unwrap();
        f.before.set_reachable(true);

        let report = f.recovery.recover().await;

        assert_eq!(report.replayed, 1);
        assert!(f.before.record(id).is_none());
        assert_eq!(f.after.record(id), Some(moved.clone()));
        assert_eq!(f.central.record(id), Some(moved));
    }

    #[tokio::test]
    async fn test_delete_replays_on_partition() {
        let f = fixture();
        let created = f.writer.create(Record::new("$1,000 Reward", 1913), IsolationLevel::default()).await.unwrap();
        let id = created.id.unwrap();

        f.before.set_reachable(false);
        assert!(f.writer.delete(id, IsolationLevel::default()).await.unwrap());
        f.before.set_reachable(true);
        assert!(f.before.record(id).is_some());

        let report = f.recovery.recover().await;

        assert_eq!(report.replayed, 1);
        assert!(f.before.record(id).is_none());
    }

    #[tokio::test]
    async fn test_malformed_entry_is_counted_and_kept() {
        let f = fixture();
        let mut session = f.central.connect().await.unwrap();
        session
            .execute(&Statement::AppendWal(NewWalEntry {
                operation: WalOperation::Insert,
                node: NodeRole::AfterCutoff,
                value: "{not json".to_string(),
            }))
            .await
            .unwrap();
        drop(session);

        let report = f.recovery.recover().await;

        assert_eq!(report.failed, 1);
        assert_eq!(f.central.active_wal().len(), 1);
        assert!(f.after.records().is_empty());
    }

    #[tokio::test]
    async fn test_redelivery_after_failed_deactivation() {
        let f = fixture();
        let created = create_while_down(&f, &f.before, Record::new("X", 1975)).await;
        f.central.fail_on("UPDATE wal_entries");

        let first = f.recovery.recover().await;
        assert_eq!(first.failed, 1);
        assert_eq!(f.central.active_wal().len(), 1);
        assert!(f.before.record(created.id.unwrap()).is_some());

        let second = f.recovery.recover().await;
        assert_eq!(second.replayed, 1);
        assert_eq!(f.before.records(), vec![created]);
        assert!(f.central.active_wal().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_reported() {
        let f = fixture();
        f.central.set_reachable(false);
        f.after.fail_on("SELECT wal_entries");

        let report = f.recovery.recover().await;

        assert_eq!(report.unreachable_origins.len(), 2);
        assert!(report.unreachable_origins.contains(&NodeRole::Central));
        assert!(report.unreachable_origins.contains(&NodeRole::AfterCutoff));
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_recovery_releases_sessions() {
        let f = fixture();
        create_while_down(&f, &f.before, Record::new("X", 1975)).await;
        f.recovery.recover().await;

        for node in [&f.central, &f.before, &f.after] {
            assert_eq!(node.leased(), 0);
        }
    }
}
