//! All-or-nothing batches of mutations in one pooled transaction.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use graphgate_cache::CacheCoordinator;
use graphgate_core::{AccessConfig, AccessError, EntityId, Mutation, Result};

use crate::pool::ConnectionPool;
use crate::query::Rows;
use crate::session::{BackendError, GraphSession};

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct BatchResult {
    pub applied: usize,
    /// Union of the ids every item touched, sorted.
    pub affected_ids: Vec<EntityId>,
    /// Cache entries removed by the single post-commit invalidation.
    pub invalidated: usize,
}

struct TxnFailure {
    reason: String,
    connection_lost: bool,
    /// The commit may have landed even though it was never acknowledged.
    outcome_unknown: bool,
}

impl TxnFailure {
    fn new(context: String, err: &BackendError) -> Self {
        Self {
            reason: format!("{context}: {err}"),
            connection_lost: err.is_connection(),
            outcome_unknown: err.is_connection(),
        }
    }

    fn at_commit(err: &BackendError) -> Self {
        Self {
            outcome_unknown: true,
            ..Self::new("commit failed".into(), err)
        }
    }
}

pub struct BatchExecutor {
    pool: Arc<ConnectionPool>,
    cache: Arc<CacheCoordinator<Rows>>,
    timeout: Duration,
}

impl BatchExecutor {
    pub fn new(
        pool: Arc<ConnectionPool>,
        cache: Arc<CacheCoordinator<Rows>>,
        config: &AccessConfig,
    ) -> Self {
        Self {
            pool,
            cache,
            timeout: config.query_timeout,
        }
    }

    /// Apply every item in one transaction on one connection.
    ///
    /// Any failure rolls the whole transaction back and is reported as
    /// `BatchFailed`; errors acquiring the connection propagate unchanged. On
    /// commit the cache is invalidated once with the union of affected ids.
    /// A timeout, lost connection or failed commit leaves the outcome
    /// unknown, so the same union is invalidated before the error returns.
    pub async fn execute_batch(&self, items: &[Mutation]) -> Result<BatchResult> {
        if items.is_empty() {
            return Ok(BatchResult::default());
        }
        let affected: BTreeSet<EntityId> = items.iter().flat_map(Mutation::affected_ids).collect();

        let mut conn = self.pool.acquire(None).await?;
        let outcome = tokio::time::timeout(self.timeout, run_transaction(conn.session(), items)).await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(failure)) => Some(failure),
            Err(_) => {
                // The transaction may still be open server-side.
                conn.retire();
                Some(TxnFailure {
                    reason: format!("timed out after {}ms", self.timeout.as_millis()),
                    connection_lost: false,
                    outcome_unknown: true,
                })
            }
        };

        if let Some(failure) = failure {
            if failure.connection_lost {
                let endpoint = conn.endpoint().to_string();
                conn.retire();
                drop(conn);
                self.pool.mark_unhealthy(&endpoint, &failure.reason);
            }
            if failure.outcome_unknown {
                let invalidated = self.cache.invalidate(&affected);
                tracing::warn!(
                    items = items.len(),
                    invalidated,
                    reason = %failure.reason,
                    "Batch outcome unknown"
                );
            } else {
                tracing::warn!(items = items.len(), reason = %failure.reason, "Batch rolled back");
            }
            return Err(AccessError::BatchFailed {
                reason: failure.reason,
            });
        }
        drop(conn);

        let invalidated = self.cache.invalidate(&affected);
        tracing::debug!(
            items = items.len(),
            affected = affected.len(),
            invalidated,
            "Batch committed"
        );

        Ok(BatchResult {
            applied: items.len(),
            affected_ids: affected.into_iter().collect(),
            invalidated,
        })
    }
}

async fn run_transaction(
    session: &mut dyn GraphSession,
    items: &[Mutation],
) -> std::result::Result<(), TxnFailure> {
    session
        .begin()
        .await
        .map_err(|e| TxnFailure::new("begin failed".into(), &e))?;

    for (i, item) in items.iter().enumerate() {
        if let Err(e) = session.apply(item).await {
            let failure = TxnFailure::new(format!("item #{} ({})", i + 1, item.kind()), &e);
            if let Err(rollback_err) = session.rollback().await {
                tracing::warn!(error = %rollback_err, "Rollback failed");
            }
            return Err(failure);
        }
    }

    session
        .commit()
        .await
        .map_err(|e| TxnFailure::at_commit(&e))
}

#[cfg(test)]
mod tests {
    use graphgate_core::{Entity, Relationship, TierKind};

    use super::*;
    use crate::executor::QueryExecutor;
    use crate::memory::MemoryGraph;
    use crate::pool::PoolConfig;
    use crate::{cypher, QuerySpec};

    struct Fixture {
        batches: BatchExecutor,
        queries: QueryExecutor,
        graph: MemoryGraph,
        pool: Arc<ConnectionPool>,
        cache: Arc<CacheCoordinator<Rows>>,
    }

    fn fixture() -> Fixture {
        let config = AccessConfig {
            endpoints: vec!["mem://a".into()],
            max_pool_size: 2,
            query_timeout: Duration::from_millis(150),
            ..AccessConfig::default()
        };
        let graph = MemoryGraph::new();
        let pool = ConnectionPool::new(
            PoolConfig::from_access_config(&config),
            Arc::new(graph.clone()),
        );
        let cache = Arc::new(CacheCoordinator::from_config(&config));
        Fixture {
            batches: BatchExecutor::new(pool.clone(), cache.clone(), &config),
            queries: QueryExecutor::new(pool.clone(), cache.clone(), &config),
            graph,
            pool,
            cache,
        }
    }

    fn doc(id: &str) -> Mutation {
        Mutation::CreateEntity(Entity::new(id, "Document"))
    }

    #[tokio::test]
    async fn commits_all_items_and_invalidates_once() {
        let f = fixture();
        f.graph.seed(&doc("1")).unwrap();
        f.queries.execute(&cypher::get_entity(&"1".into())).await.unwrap();
        assert_eq!(f.cache.tier(TierKind::Node).len(), 1);

        let result = f
            .batches
            .execute_batch(&[
                doc("2"),
                doc("3"),
                Mutation::CreateRelationship(Relationship::new("1", "2", "CITES")),
            ])
            .await
            .unwrap();

        assert_eq!(result.applied, 3);
        let ids: Vec<&str> = result.affected_ids.iter().map(EntityId::as_str).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(result.invalidated, 1);
        assert_eq!(f.graph.entity_count(), 3);
        assert_eq!(f.cache.tier(TierKind::Node).len(), 0);
        assert_eq!(f.pool.health().idle_count, 1);
    }

    #[tokio::test]
    async fn failing_item_rolls_back_everything() {
        let f = fixture();
        f.graph.seed(&doc("10")).unwrap();

        let err = f
            .batches
            .execute_batch(&[doc("1"), doc("2"), doc("10"), doc("4"), doc("5")])
            .await
            .unwrap_err();

        match err {
            AccessError::BatchFailed { reason } => assert!(reason.starts_with("item #3")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(f.graph.entity_count(), 1);
        assert_eq!(f.pool.health().idle_count, 1);
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let f = fixture();
        let result = f.batches.execute_batch(&[]).await.unwrap();
        assert_eq!(result, BatchResult::default());
        assert_eq!(f.graph.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn pool_errors_propagate_unchanged() {
        let f = fixture();
        f.graph.set_endpoint_down("mem://a", true);
        let err = f.batches.execute_batch(&[doc("1")]).await.unwrap_err();
        assert!(matches!(err, AccessError::BackendUnavailable { .. }));
    }

    #[tokio::test]
    async fn lost_connection_mid_batch_is_batch_failed() {
        let f = fixture();
        f.queries.execute(&QuerySpec::new(cypher::PING)).await.unwrap();
        f.graph.set_endpoint_down("mem://a", true);

        let err = f.batches.execute_batch(&[doc("1")]).await.unwrap_err();
        assert!(matches!(err, AccessError::BatchFailed { .. }));
        assert_eq!(f.pool.health().unhealthy_endpoints, vec!["mem://a".to_string()]);
        assert_eq!(f.pool.health().idle_count, 0);
    }

    #[tokio::test]
    async fn lost_connection_invalidates_every_item() {
        let f = fixture();
        f.graph.seed(&doc("1")).unwrap();
        f.graph.seed(&doc("2")).unwrap();
        f.queries.execute(&cypher::get_entity(&"1".into())).await.unwrap();
        f.queries.execute(&cypher::get_entity(&"2".into())).await.unwrap();
        assert_eq!(f.cache.tier(TierKind::Node).len(), 2);
        f.graph.set_endpoint_down("mem://a", true);

        let err = f
            .batches
            .execute_batch(&[
                Mutation::UpdateEntity(Entity::new("1", "Document").with_property("v", 1)),
                Mutation::UpdateEntity(Entity::new("2", "Document").with_property("v", 1)),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::BatchFailed { .. }));
        assert_eq!(f.cache.tier(TierKind::Node).len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_commit_invalidates_and_is_visible() {
        let f = fixture();
        f.graph.seed(&doc("1")).unwrap();
        let read = cypher::get_entity(&"1".into());
        f.queries.execute(&read).await.unwrap();

        // The item is acknowledged at 100ms and the commit applied, but its
        // acknowledgement would arrive after the 150ms deadline.
        f.graph.set_latency(Duration::from_millis(100));
        let err = f
            .batches
            .execute_batch(&[Mutation::UpdateEntity(
                Entity::new("1", "Document").with_property("title", "landed"),
            )])
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::BatchFailed { ref reason } if reason.starts_with("timed out")));
        assert_eq!(f.pool.stats().retired, 1);

        f.graph.set_latency(Duration::ZERO);
        let fresh = f.queries.execute(&read).await.unwrap();
        assert!(!fresh.from_cache);
        assert_eq!(fresh.rows[0]["properties"]["title"], "landed");
    }

    #[tokio::test]
    async fn rejected_item_leaves_the_cache_alone() {
        let f = fixture();
        f.graph.seed(&doc("1")).unwrap();
        f.queries.execute(&cypher::get_entity(&"1".into())).await.unwrap();

        let err = f.batches.execute_batch(&[doc("1")]).await.unwrap_err();
        assert!(matches!(err, AccessError::BatchFailed { .. }));
        assert_eq!(f.cache.tier(TierKind::Node).len(), 1);
    }
}
