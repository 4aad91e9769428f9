//! The access-layer context: one explicitly constructed owner of the pool,
//! cache, monitor, executors, and background maintenance tasks.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use graphgate_cache::{CacheCoordinator, TierStats};
use graphgate_core::{
    AccessConfig, AccessError, Entity, EntityId, Mutation, Relationship, Result, SearchRequest,
    TraversalRequest,
};
use graphgate_monitor::{MemorySampler, MonitorSummary, OperationMetric, PerformanceMonitor};

use crate::batch::{BatchExecutor, BatchResult};
use crate::cypher;
use crate::executor::QueryExecutor;
use crate::pool::{ConnectionPool, PoolConfig, PoolHealth, PoolStats};
use crate::query::{QueryResult, QuerySpec, Rows};
use crate::session::{BackendError, SessionFactory};

pub struct GraphAccess {
    config: Arc<AccessConfig>,
    pool: Arc<ConnectionPool>,
    cache: Arc<CacheCoordinator<Rows>>,
    monitor: Arc<PerformanceMonitor>,
    queries: QueryExecutor,
    batches: BatchExecutor,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GraphAccess {
    /// Validate `config`, allocate the pool and cache, and start background
    /// maintenance. Must be called inside a Tokio runtime.
    pub async fn start(config: AccessConfig, factory: Arc<dyn SessionFactory>) -> Result<Self> {
        let monitor = PerformanceMonitor::from_config(&config);
        Self::start_with_monitor(config, factory, monitor).await
    }

    /// Like [`GraphAccess::start`] with a caller-built monitor, e.g. one with
    /// a custom alert sink or memory sampler.
    pub async fn start_with_monitor(
        config: AccessConfig,
        factory: Arc<dyn SessionFactory>,
        monitor: PerformanceMonitor,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let pool = ConnectionPool::new(PoolConfig::from_access_config(&config), factory);
        let cache = Arc::new(CacheCoordinator::from_config(&config));
        let cancel = CancellationToken::new();

        let mut tasks = vec![
            spawn_pool_maintenance(pool.clone(), config.health_check_interval, cancel.clone()),
            spawn_cache_sweep(cache.clone(), config.sweep_interval, cancel.clone()),
        ];
        if config.sample_memory {
            tasks.push(spawn_memory_sampler(
                monitor.memory_sampler(),
                config.memory_sample_interval,
                cancel.clone(),
            ));
        }

        tracing::info!(
            endpoints = ?config.endpoints,
            max_pool_size = config.max_pool_size,
            memory_budget_mb = config.global_memory_budget_mb,
            "Graph access layer started"
        );

        Ok(Self {
            queries: QueryExecutor::new(pool.clone(), cache.clone(), &config),
            batches: BatchExecutor::new(pool.clone(), cache.clone(), &config),
            config,
            pool,
            cache,
            monitor: Arc::new(monitor),
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn config(&self) -> &AccessConfig {
        &self.config
    }

    fn ensure_running(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(AccessError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    // ── Reads ────────────────────────────────────────────────────

    pub async fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>> {
        self.monitor
            .wrap("get_entity", async {
                self.ensure_running()?;
                let result = self.queries.execute(&cypher::get_entity(id)).await?;
                result.rows.first().map(decode).transpose()
            })
            .await
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<Entity>> {
        self.monitor
            .wrap("search", async {
                self.ensure_running()?;
                let spec = cypher::search(request).map_err(invalid)?;
                decode_all(&self.queries.execute(&spec).await?)
            })
            .await
    }

    pub async fn traverse(&self, request: &TraversalRequest) -> Result<Vec<Entity>> {
        self.monitor
            .wrap("traverse", async {
                self.ensure_running()?;
                let spec = cypher::traverse(request).map_err(invalid)?;
                decode_all(&self.queries.execute(&spec).await?)
            })
            .await
    }

    pub async fn relationships(&self, id: &EntityId) -> Result<Vec<Relationship>> {
        self.monitor
            .wrap("relationships", async {
                self.ensure_running()?;
                decode_all(&self.queries.execute(&cypher::relationships(id)).await?)
            })
            .await
    }

    /// Run a caller-built read spec.
    pub async fn execute(&self, spec: &QuerySpec) -> Result<QueryResult> {
        self.monitor
            .wrap("execute", async {
                self.ensure_running()?;
                self.queries.execute(spec).await
            })
            .await
    }

    // ── Writes ───────────────────────────────────────────────────

    pub async fn create_entity(&self, entity: Entity) -> Result<()> {
        self.mutate(Mutation::CreateEntity(entity)).await
    }

    pub async fn update_entity(&self, entity: Entity) -> Result<()> {
        self.mutate(Mutation::UpdateEntity(entity)).await
    }

    pub async fn delete_entity(&self, id: EntityId) -> Result<()> {
        self.mutate(Mutation::DeleteEntity { id }).await
    }

    pub async fn create_relationship(&self, relationship: Relationship) -> Result<()> {
        self.mutate(Mutation::CreateRelationship(relationship)).await
    }

    pub async fn delete_relationship(
        &self,
        source: EntityId,
        target: EntityId,
        rel_type: impl Into<String>,
    ) -> Result<()> {
        self.mutate(Mutation::DeleteRelationship {
            source,
            target,
            rel_type: rel_type.into(),
        })
        .await
    }

    async fn mutate(&self, mutation: Mutation) -> Result<()> {
        self.monitor
            .wrap(mutation.kind(), async {
                self.ensure_running()?;
                self.queries.apply(&mutation).await.map(|_| ())
            })
            .await
    }

    pub async fn execute_batch(&self, items: &[Mutation]) -> Result<BatchResult> {
        self.monitor
            .wrap("execute_batch", async {
                self.ensure_running()?;
                self.batches.execute_batch(items).await
            })
            .await
    }

    // ── Observability ────────────────────────────────────────────

    pub fn cache_stats(&self) -> Vec<TierStats> {
        self.cache.stats()
    }

    pub fn health(&self) -> PoolHealth {
        self.pool.health()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn metrics_summary(&self) -> MonitorSummary {
        self.monitor.summary()
    }

    pub fn subscribe_metrics(&self) -> broadcast::Receiver<OperationMetric> {
        self.monitor.subscribe()
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Stop and join the background tasks, close the pool, and flush the
    /// monitor. Later calls fail with `ShuttingDown`; repeated shutdowns are
    /// harmless.
    pub async fn shutdown(&self) -> MonitorSummary {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.pool.close();
        self.cache.clear();
        let summary = self.monitor.flush();
        tracing::info!("Graph access layer shut down");
        summary
    }
}

impl Drop for GraphAccess {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn decode(row: &Value) -> Result<Entity> {
    Ok(serde_json::from_value(row.clone())?)
}

fn decode_all<T: serde::de::DeserializeOwned>(result: &QueryResult) -> Result<Vec<T>> {
    result
        .rows
        .iter()
        .map(|row| serde_json::from_value(row.clone()).map_err(AccessError::from))
        .collect()
}

fn invalid(err: BackendError) -> AccessError {
    AccessError::Query(err.to_string())
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn spawn_pool_maintenance(
    pool: Arc<ConnectionPool>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = ticker(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                report = pool.maintain() => {
                    if report.endpoints_restored + report.pings_failed + report.reaped > 0 {
                        tracing::debug!(
                            restored = report.endpoints_restored,
                            pings_failed = report.pings_failed,
                            reaped = report.reaped,
                            "Pool maintenance"
                        );
                    }
                }
            }
        }
        tracing::debug!("Pool maintenance stopped");
    })
}

fn spawn_cache_sweep(
    cache: Arc<CacheCoordinator<Rows>>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = ticker(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let purged = cache.purge_expired();
                    if purged > 0 {
                        tracing::debug!(purged, "Expired cache entries swept");
                    }
                }
            }
        }
        tracing::debug!("Cache sweep stopped");
    })
}

/// Refresh the process memory sample off the request path. Monitored calls
/// only read the last value.
fn spawn_memory_sampler(
    sampler: Arc<dyn MemorySampler>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let sampler = sampler.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || sampler.refresh()).await {
                tracing::warn!(error = %e, "Memory sample failed");
            }
        }
        tracing::debug!("Memory sampler stopped");
    })
}
