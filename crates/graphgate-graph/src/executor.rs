//! Cached, deadline-bounded reads and single auto-commit writes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use graphgate_cache::{CacheCoordinator, PutOutcome};
use graphgate_core::{AccessConfig, AccessError, EntityId, Mutation, Result};

use crate::pool::ConnectionPool;
use crate::query::{touched_ids, QueryResult, QuerySpec, Rows};
use crate::session::{BackendError, GraphSession};

/// What to run on a pooled session.
enum Call<'a> {
    Fetch(&'a QuerySpec),
    Apply(&'a Mutation),
}

impl Call<'_> {
    async fn run(&self, session: &mut dyn GraphSession) -> std::result::Result<Vec<Value>, BackendError> {
        match self {
            Call::Fetch(spec) => session.fetch(spec).await,
            Call::Apply(m) => session.apply(m).await.map(|()| Vec::new()),
        }
    }

    /// Reads can be replayed on another endpoint; a write that reached the
    /// backend may already have landed.
    fn replayable(&self) -> bool {
        matches!(self, Call::Fetch(_))
    }
}

/// A failed call. `outcome_unknown` is set when a write was sent but never
/// acknowledged.
struct Failure {
    error: AccessError,
    outcome_unknown: bool,
}

impl From<AccessError> for Failure {
    fn from(error: AccessError) -> Self {
        Self {
            error,
            outcome_unknown: false,
        }
    }
}

pub struct QueryExecutor {
    pool: Arc<ConnectionPool>,
    cache: Arc<CacheCoordinator<Rows>>,
    query_timeout: Duration,
}

impl QueryExecutor {
    pub fn new(
        pool: Arc<ConnectionPool>,
        cache: Arc<CacheCoordinator<Rows>>,
        config: &AccessConfig,
    ) -> Self {
        Self {
            pool,
            cache,
            query_timeout: config.query_timeout,
        }
    }

    /// Run a read, answering from the cache when the query names a tier and
    /// an entry exists. Fresh results are cached tagged with every entity id
    /// they touch, unless one of those ids was invalidated while the read
    /// was in flight.
    pub async fn execute(&self, spec: &QuerySpec) -> Result<QueryResult> {
        let cached = match spec.target_tier {
            Some(tier) => Some((tier, spec.cache_key()?)),
            None => None,
        };
        if let Some((tier, key)) = &cached {
            if let Some(rows) = self.cache.get(*tier, key) {
                tracing::trace!(tier = %tier, "Cache hit");
                return Ok(QueryResult {
                    rows,
                    from_cache: true,
                });
            }
        }

        let resolved = QuerySpec {
            timeout_ms: Some(spec.timeout_ms.unwrap_or(self.query_timeout.as_millis() as u64)),
            ..spec.clone()
        };
        let epoch = self.cache.epoch();
        let rows: Rows = Arc::new(
            self.run(&Call::Fetch(&resolved), &resolved)
                .await
                .map_err(|f| f.error)?,
        );

        if let Some((tier, key)) = cached {
            let size_bytes = serde_json::to_string(&*rows)?.len();
            let deps = touched_ids(spec, &rows);
            match self.cache.put_since(epoch, tier, key, rows.clone(), size_bytes, deps) {
                PutOutcome::Stored { evicted } if evicted > 0 => {
                    tracing::debug!(tier = %tier, evicted, "Cache evicted to make room");
                }
                PutOutcome::Stored { .. } => {}
                PutOutcome::Stale => {
                    tracing::debug!(tier = %tier, "Read raced a mutation, result not cached");
                }
                PutOutcome::Oversized | PutOutcome::OverBudget => {
                    tracing::debug!(tier = %tier, size_bytes, "Result bypassed the cache");
                }
            }
        }

        Ok(QueryResult {
            rows,
            from_cache: false,
        })
    }

    /// Apply one mutation outside any transaction, then invalidate what it
    /// touched. A write that timed out or lost its connection may still have
    /// landed, so it invalidates as well before reporting the error.
    pub async fn apply(&self, mutation: &Mutation) -> Result<Vec<EntityId>> {
        let spec = QuerySpec::new(mutation.kind())
            .with_timeout_ms(self.query_timeout.as_millis() as u64);
        let affected = mutation.affected_ids();

        match self.run(&Call::Apply(mutation), &spec).await {
            Ok(_) => {
                let removed = self.cache.invalidate(&affected);
                tracing::debug!(op = mutation.kind(), invalidated = removed, "Mutation applied");
                Ok(affected)
            }
            Err(failure) => {
                if failure.outcome_unknown {
                    let removed = self.cache.invalidate(&affected);
                    tracing::warn!(
                        op = mutation.kind(),
                        invalidated = removed,
                        error = %failure.error,
                        "Write outcome unknown"
                    );
                }
                Err(failure.error)
            }
        }
    }

    /// Run `call` on a pooled connection under the query's deadline. Reads
    /// fail over once per remaining endpoint on connection failure; once
    /// every endpoint is down the failure surfaces as `BackendUnavailable`.
    /// Writes are never replayed.
    async fn run(&self, call: &Call<'_>, spec: &QuerySpec) -> std::result::Result<Vec<Value>, Failure> {
        let timeout_ms = spec
            .timeout_ms
            .unwrap_or(self.query_timeout.as_millis() as u64);
        let deadline = Duration::from_millis(timeout_ms);
        let mut attempts = 0;

        loop {
            let mut conn = self.pool.acquire(None).await?;
            attempts += 1;

            match tokio::time::timeout(deadline, call.run(conn.session())).await {
                Ok(Ok(rows)) => return Ok(rows),
                Ok(Err(BackendError::Connection(reason))) => {
                    let endpoint = conn.endpoint().to_string();
                    conn.retire();
                    drop(conn);
                    self.pool.mark_unhealthy(&endpoint, &reason);
                    let configured = self.pool.config().endpoints.len();
                    if !call.replayable() || attempts >= configured {
                        let unhealthy = self.pool.health().unhealthy_endpoints;
                        let error = if unhealthy.len() == configured {
                            AccessError::BackendUnavailable {
                                endpoints: unhealthy,
                            }
                        } else {
                            AccessError::ConnectionFailure { endpoint, reason }
                        };
                        return Err(Failure {
                            error,
                            outcome_unknown: !call.replayable(),
                        });
                    }
                    tracing::warn!(endpoint = %endpoint, attempt = attempts, "Retrying on next endpoint");
                }
                Ok(Err(e)) => return Err(AccessError::Query(e.to_string()).into()),
                Err(_) => {
                    conn.retire();
                    tracing::warn!(
                        endpoint = %conn.endpoint(),
                        timeout_ms,
                        "Query deadline exceeded, retiring connection"
                    );
                    return Err(Failure {
                        error: AccessError::QueryTimeout { timeout_ms },
                        outcome_unknown: !call.replayable(),
                    });
                }
            }
        }
    }
}
