//! Record Reader
//!
//! Reads never touch the WAL and never fail because one node is down:
//! unreachable nodes are skipped and the central node's copy is replaced by
//! the merged partitions when central cannot be reached.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::node::{NodeRegistry, NodeRole, NodeSession, RankAggregate, RecordQuery, RetryPolicy};
use crate::record::Record;

/// Records returned by `list` when no limit is given
pub const DEFAULT_LIST_LIMIT: u32 = 10;

/// Upper bound on any listing
pub const MAX_LIST_LIMIT: u32 = 1000;

/// Aggregate of `rank` and the nodes it was computed from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankReport {
    pub aggregate: RankAggregate,
    pub value: Option<f64>,
    pub nodes: Vec<NodeRole>,
}

/// Read-side counterpart of the write coordinator
pub struct RecordReader {
    registry: Arc<NodeRegistry>,
    policy: RetryPolicy,
}

impl RecordReader {
    pub fn new(registry: Arc<NodeRegistry>, policy: RetryPolicy) -> Self {
        Self { registry, policy }
    }

    /// Look a record up on every node at once; central wins, then the
    /// partitions in order.
    pub async fn get(&self, id: Uuid) -> Result<Option<Record>> {
        let query = RecordQuery::ById(id);
        let results = join_all(NodeRole::ALL.iter().map(|role| self.fetch_from(*role, &query))).await;

        let mut reached = false;
        for records in results.into_iter().flatten() {
            reached = true;
            if let Some(record) = records.into_iter().next() {
                return Ok(Some(record));
            }
        }

        if reached {
            Ok(None)
        } else {
            Err(Error::NodeUnavailable {
                operation: "get".to_string(),
            })
        }
    }

    /// Records ordered by name
    pub async fn list(&self, limit: Option<u32>) -> Result<Vec<Record>> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        self.query_with_fallback("list", RecordQuery::All { limit }).await
    }

    /// Records whose name contains `needle`, ignoring case
    pub async fn search(&self, needle: &str, limit: Option<u32>) -> Result<Vec<Record>> {
        let limit = limit.unwrap_or(MAX_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        let query = RecordQuery::NameContains {
            needle: needle.to_string(),
            limit,
        };
        self.query_with_fallback("search", query).await
    }

    /// Aggregate `rank` over all records
    pub async fn report(&self, aggregate: RankAggregate) -> Result<RankReport> {
        if let Some(mut session) = self.session(NodeRole::Central).await {
            match session.aggregate_rank(aggregate).await {
                Ok(value) => {
                    return Ok(RankReport {
                        aggregate,
                        value,
                        nodes: vec![NodeRole::Central],
                    })
                }
                Err(e) => tracing::warn!("report on central node failed: {}", e),
            }
        }

        tracing::warn!("Central node unavailable for report, combining partitions");
        let (before, after) = futures::join!(
            self.partition_part(NodeRole::BeforeCutoff, aggregate),
            self.partition_part(NodeRole::AfterCutoff, aggregate)
        );

        let mut nodes = Vec::new();
        let mut parts = Vec::new();
        for (role, part) in [(NodeRole::BeforeCutoff, before), (NodeRole::AfterCutoff, after)] {
            if let Some(part) = part {
                nodes.push(role);
                parts.push(part);
            }
        }

        if nodes.is_empty() {
            return Err(Error::NodeUnavailable {
                operation: "report".to_string(),
            });
        }

        Ok(RankReport {
            aggregate,
            value: combine(aggregate, &parts),
            nodes,
        })
    }

    async fn query_with_fallback(&self, operation: &str, query: RecordQuery) -> Result<Vec<Record>> {
        if let Some(records) = self.fetch_from(NodeRole::Central, &query).await {
            return Ok(records);
        }

        tracing::warn!("Central node unavailable for {}, reading partitions", operation);
        let (before, after) = futures::join!(
            self.fetch_from(NodeRole::BeforeCutoff, &query),
            self.fetch_from(NodeRole::AfterCutoff, &query)
        );

        if before.is_none() && after.is_none() {
            return Err(Error::NodeUnavailable {
                operation: operation.to_string(),
            });
        }

        let mut merged: Vec<Record> = before.into_iter().chain(after).flatten().collect();
        merged.sort_by(|a, b| a.name.cmp(&b.name));
        merged.truncate(query.limit() as usize);
        Ok(merged)
    }

    /// `None` when the node is unreachable or the query fails
    async fn fetch_from(&self, role: NodeRole, query: &RecordQuery) -> Option<Vec<Record>> {
        let mut session = self.session(role).await?;
        match session.fetch_records(query).await {
            Ok(records) => Some(records),
            Err(e) => {
                tracing::warn!("Read from {} node failed: {}", role, e);
                None
            }
        }
    }

    /// A partition's share of an aggregate: the value, plus the row count
    /// when averaging so partial averages can be weighted.
    async fn partition_part(&self, role: NodeRole, aggregate: RankAggregate) -> Option<(Option<f64>, f64)> {
        let mut session = self.session(role).await?;
        let result = match aggregate {
            RankAggregate::Avg => sum_and_count(session.as_mut()).await,
            other => session.aggregate_rank(other).await.map(|value| (value, 0.0)),
        };
        match result {
            Ok(part) => Some(part),
            Err(e) => {
                tracing::warn!("Report on {} node failed: {}", role, e);
                None
            }
        }
    }

    async fn session(&self, role: NodeRole) -> Option<Box<dyn NodeSession>> {
        self.registry.acquire(role, &self.policy).await.into_session()
    }
}

async fn sum_and_count(session: &mut dyn NodeSession) -> Result<(Option<f64>, f64)> {
    let sum = session.aggregate_rank(RankAggregate::Sum).await?;
    let count = session.aggregate_rank(RankAggregate::Count).await?;
    Ok((sum, count.unwrap_or(0.0)))
}

/// Merge per-partition results; partitions hold disjoint rows
fn combine(aggregate: RankAggregate, parts: &[(Option<f64>, f64)]) -> Option<f64> {
    let values = parts.iter().filter_map(|(value, _)| *value);
    match aggregate {
        RankAggregate::Min => values.reduce(f64::min),
        RankAggregate::Max => values.reduce(f64::max),
        RankAggregate::Sum => values.reduce(|a, b| a + b),
        RankAggregate::Count => Some(values.sum()),
        RankAggregate::Avg => {
            let count: f64 = parts.iter().map(|(_, count)| count).sum();
            if count == 0.0 {
                None
            } else {
                Some(values.sum::<f64>() / count)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::memory::MemoryNode;

    struct Fixture {
        central: Arc<MemoryNode>,
        before: Arc<MemoryNode>,
        after: Arc<MemoryNode>,
        reader: RecordReader,
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
            reader: RecordReader::new(registry, RetryPolicy::immediate(1)),
        }
    }

    fn record(name: &str, year: i32, rank: Option<f64>) -> Record {
        let mut record = Record::new(name, year);
        record.id = Some(Uuid::new_v4());
        record.rank = rank;
        record
    }

    /// Seed central and the owning partition the way a committed write would
    fn seed(f: &Fixture, record: &Record) {
        f.central.seed(record.clone()).unwrap();
        let partition = if record.year < 1980 { &f.before } else { &f.after };
        partition.seed(record.clone()).unwrap();
    }

    #[tokio::test]
    async fn test_get_prefers_central() {
        let f = fixture();
        let stored = record("Melanie Darrow", 1997, Some(5.1));
        let mut stale = stored.clone();
        stale.rank = Some(1.0);
        f.central.seed(stored.clone()).unwrap();
        f.after.seed(stale).unwrap();

        assert_eq!(f.reader.get(stored.id.unwrap()).await.unwrap(), Some(stored));
    }

    #[tokio::test]
    async fn test_get_falls_through_to_partition() {
        let f = fixture();
        let only_on_partition = record("$1,000 Reward", 1913, None);
        f.before.seed(only_on_partition.clone()).unwrap();
        f.central.set_reachable(false);

        let found = f.reader.get(only_on_partition.id.unwrap()).await.unwrap();
        assert_eq!(found, Some(only_on_partition));
    }

    #[tokio::test]
    async fn test_get_missing_and_unreachable() {
        let f = fixture();
        assert_eq!(f.reader.get(Uuid::new_v4()).await.unwrap(), None);

        for node in [&f.central, &f.before, &f.after] {
            node.set_reachable(false);
        }
        let err = f.reader.get(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::NodeUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_list_defaults_to_ten() {
        let f = fixture();
        for i in 0..15 {
            seed(&f, &record(&format!("Record {:02}", i), 1950 + i * 4, None));
        }

        let listed = f.reader.list(None).await.unwrap();
        assert_eq!(listed.len(), 10);
        assert_eq!(listed[0].name, "Record 00");
        assert_eq!(f.reader.list(Some(3)).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_list_merges_partitions_when_central_down() {
        let f = fixture();
        seed(&f, &record("Zorro", 1975, None));
        seed(&f, &record("Alpha", 2001, None));
        seed(&f, &record("Melanie Darrow", 1997, None));
        f.central.set_reachable(false);

        let names: Vec<String> = f.reader.list(None).await.unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["Alpha", "Melanie Darrow", "Zorro"]);
    }

    #[tokio::test]
    async fn test_search_is_case_insensitive() {
        let f = fixture();
        seed(&f, &record("Melanie Darrow", 1997, None));
        seed(&f, &record("Melanios letzte Liebe", 1991, None));
        seed(&f, &record("$1,000 Reward", 1913, None));

        let found = f.reader.search("MELAN", None).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(f.reader.search("nothing like it", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_report_on_central() {
        let f = fixture();
        seed(&f, &record("A", 1970, Some(4.0)));
        seed(&f, &record("B", 1990, Some(8.0)));
        seed(&f, &record("C", 1995, None));

        let report = f.reader.report(RankAggregate::Avg).await.unwrap();
        assert_eq!(report.value, Some(6.0));
        assert_eq!(report.nodes, vec![NodeRole::Central]);

        let count = f.reader.report(RankAggregate::Count).await.unwrap();
        assert_eq!(count.value, Some(2.0));
    }

    #[tokio::test]
    async fn test_report_weights_partition_averages() {
        let f = fixture();
        seed(&f, &record("A", 1970, Some(2.0)));
        seed(&f, &record("B", 1990, Some(6.0)));
        seed(&f, &record("C", 1995, Some(7.0)));
        f.central.set_reachable(false);

        let avg = f.reader.report(RankAggregate::Avg).await.unwrap();
        assert_eq!(avg.value, Some(5.0));
        assert_eq!(avg.nodes, vec![NodeRole::BeforeCutoff, NodeRole::AfterCutoff]);

        assert_eq!(f.reader.report(RankAggregate::Min).await.unwrap().value, Some(2.0));
        assert_eq!(f.reader.report(RankAggregate::Max).await.unwrap().value, Some(7.0));
        assert_eq!(f.reader.report(RankAggregate::Sum).await.unwrap().value, Some(15.0));
    }

    #[tokio::test]
    async fn test_report_without_nodes_fails() {
        let f = fixture();
        f.central.set_reachable(false);
        f.before.set_reachable(false);
        f.after.set_reachable(false);

        let err = f.reader.report(RankAggregate::Sum).await.unwrap_err();
        assert!(matches!(err, Error::NodeUnavailable { .. }));
    }

    #[test]
    fn test_combine_empty_partitions() {
        assert_eq!(combine(RankAggregate::Avg, &[(None, 0.0), (None, 0.0)]), None);
        assert_eq!(combine(RankAggregate::Count, &[(Some(0.0), 0.0)]), Some(0.0));
        assert_eq!(combine(RankAggregate::Max, &[(None, 0.0), (Some(3.5), 0.0)]), Some(3.5));
    }
}
