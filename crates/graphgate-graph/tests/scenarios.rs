//! End-to-end behaviour of the access layer over the in-memory backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use graphgate_core::{
    AccessConfig, AccessError, Entity, EntityId, Mutation, Relationship, SearchRequest, TierConfig,
    TierKind, TraversalRequest,
};
use graphgate_graph::{
    cypher, ConnectionPool, GraphAccess, MemoryGraph, PoolConfig, QuerySpec,
};
use graphgate_monitor::{
    AlertThreshold, MemoryAlertSink, MemorySampler, NoopSampler, PerformanceMonitor,
};

fn test_config() -> AccessConfig {
    AccessConfig {
        endpoints: vec!["mem://primary".into(), "mem://replica".into()],
        max_pool_size: 4,
        acquisition_timeout: Duration::from_millis(100),
        query_timeout: Duration::from_millis(200),
        sample_memory: false,
        ..AccessConfig::default()
    }
}

async fn start(config: AccessConfig) -> (GraphAccess, MemoryGraph) {
    let graph = MemoryGraph::new();
    let access = GraphAccess::start(config, Arc::new(graph.clone()))
        .await
        .unwrap();
    (access, graph)
}

fn doc(id: &str, title: &str) -> Entity {
    Entity::new(id, "Document").with_property("title", title)
}

#[tokio::test(start_paused = true)]
async fn pool_of_two_exhausts_on_third_acquire() {
    let pool = ConnectionPool::new(
        PoolConfig {
            max_size: 2,
            acquisition_timeout: Duration::from_millis(100),
            max_lifetime: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(300),
            endpoints: vec!["mem://primary".into()],
        },
        Arc::new(MemoryGraph::new()),
    );

    let first = pool.acquire(None).await.unwrap();
    let second = pool.acquire(None).await.unwrap();

    let started = tokio::time::Instant::now();
    let err = pool.acquire(None).await.err().unwrap();
    let waited = started.elapsed();

    assert!(matches!(err, AccessError::PoolExhausted { .. }));
    assert!(waited >= Duration::from_millis(100));
    assert!(waited < Duration::from_millis(150));
    drop((first, second));
}

#[tokio::test(start_paused = true)]
async fn node_tier_of_two_evicts_least_recently_used() {
    let mut config = test_config();
    config.tiers.node = TierConfig::new(2, 60);
    let (access, graph) = start(config).await;
    for id in ["A", "B", "C"] {
        graph.seed(&Mutation::CreateEntity(doc(id, id))).unwrap();
    }

    for id in ["A", "B", "C"] {
        access.get_entity(&EntityId::from(id)).await.unwrap();
    }

    let a = access.execute(&cypher::get_entity(&"A".into())).await.unwrap();
    assert!(!a.from_cache, "A should have been evicted");
    let c = access.execute(&cypher::get_entity(&"C".into())).await.unwrap();
    assert!(c.from_cache);

    let node = &access.cache_stats()[TierKind::Node.index()];
    assert_eq!(node.size, 2);
    assert!(node.evictions >= 1);
    access.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn update_invalidates_node_and_search_entries() {
    let (access, _) = start(test_config()).await;
    access
        .create_entity(doc("42", "Graph access patterns"))
        .await
        .unwrap();

    let entity = access.get_entity(&"42".into()).await.unwrap().unwrap();
    assert_eq!(entity.properties["title"], "Graph access patterns");
    let hits = access.search(&SearchRequest::new("access")).await.unwrap();
    assert_eq!(hits.len(), 1);

    let node_read = cypher::get_entity(&"42".into());
    let search_read = cypher::search(&SearchRequest::new("access")).unwrap();
    assert!(access.execute(&node_read).await.unwrap().from_cache);
    assert!(access.execute(&search_read).await.unwrap().from_cache);

    access
        .update_entity(Entity::new("42", "Document").with_property("title", "Revised"))
        .await
        .unwrap();

    assert!(!access.execute(&node_read).await.unwrap().from_cache);
    assert!(!access.execute(&search_read).await.unwrap().from_cache);
    let entity = access.get_entity(&"42".into()).await.unwrap().unwrap();
    assert_eq!(entity.properties["title"], "Revised");
    access.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn batch_with_failing_item_leaves_nothing_behind() {
    let (access, graph) = start(test_config()).await;
    graph.seed(&Mutation::CreateEntity(doc("taken", "x"))).unwrap();

    let items = vec![
        Mutation::CreateEntity(doc("b1", "one")),
        Mutation::CreateEntity(doc("b2", "two")),
        Mutation::CreateEntity(doc("taken", "duplicate")),
        Mutation::CreateEntity(doc("b4", "four")),
        Mutation::CreateRelationship(Relationship::new("b1", "b2", "CITES")),
    ];

    let err = access.execute_batch(&items).await.unwrap_err();
    assert!(matches!(err, AccessError::BatchFailed { .. }), "{err}");

    for id in ["b1", "b2", "b4"] {
        assert_eq!(access.get_entity(&id.into()).await.unwrap(), None);
    }
    assert!(access.relationships(&"b1".into()).await.unwrap().is_empty());
    assert_eq!(graph.entity_count(), 1);
    access.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn slow_read_racing_an_update_is_not_cached() {
    let (access, graph) = start(test_config()).await;
    let access = Arc::new(access);
    graph.seed(&Mutation::CreateEntity(doc("42", "v0"))).unwrap();
    graph.set_latency(Duration::from_millis(100));

    let reader = tokio::spawn({
        let access = access.clone();
        async move { access.get_entity(&"42".into()).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    graph.set_latency(Duration::ZERO);
    access.update_entity(doc("42", "v1")).await.unwrap();

    let overtaken = reader.await.unwrap().unwrap().unwrap();
    assert_eq!(overtaken.properties["title"], "v0");

    let read = access.execute(&cypher::get_entity(&"42".into())).await.unwrap();
    assert!(!read.from_cache);
    assert_eq!(read.rows[0]["properties"]["title"], "v1");
    access.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn timed_out_update_still_invalidates() {
    let (access, graph) = start(test_config()).await;
    graph.seed(&Mutation::CreateEntity(doc("7", "v0"))).unwrap();
    access.get_entity(&"7".into()).await.unwrap();

    graph.set_latency(Duration::from_secs(1));
    let err = access.update_entity(doc("7", "v1")).await.unwrap_err();
    assert!(matches!(err, AccessError::QueryTimeout { timeout_ms: 200 }));

    graph.set_latency(Duration::ZERO);
    let read = access.execute(&cypher::get_entity(&"7".into())).await.unwrap();
    assert!(!read.from_cache);
    assert_eq!(read.rows[0]["properties"]["title"], "v1");
    access.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn writes_are_not_replayed_on_another_endpoint() {
    let (access, graph) = start(test_config()).await;
    access.create_entity(doc("1", "a")).await.unwrap();
    access.get_entity(&"1".into()).await.unwrap();
    graph.set_endpoint_down("mem://primary", true);
    let opened = graph.sessions_opened();

    let err = access.update_entity(doc("1", "b")).await.unwrap_err();
    assert!(matches!(err, AccessError::ConnectionFailure { .. }), "{err}");
    assert_eq!(graph.sessions_opened(), opened);
    assert_eq!(graph.entity(&"1".into()).unwrap().properties["title"], "a");

    // The cached read was dropped and the next one goes to the replica.
    let read = access.execute(&cypher::get_entity(&"1".into())).await.unwrap();
    assert!(!read.from_cache);
    assert_eq!(graph.sessions_opened(), opened + 1);
    access.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn slow_query_times_out_without_returning_connection() {
    let mut config = test_config();
    config.query_timeout = Duration::from_millis(50);
    let (access, graph) = start(config).await;
    graph.set_latency(Duration::from_secs(5));

    let started = tokio::time::Instant::now();
    let err = access.get_entity(&"1".into()).await.unwrap_err();
    let took = started.elapsed();

    assert!(matches!(err, AccessError::QueryTimeout { timeout_ms: 50 }));
    assert!(took >= Duration::from_millis(50) && took < Duration::from_millis(100));

    let health = access.health();
    assert_eq!(health.idle_count, 0);
    assert_eq!(health.in_use_count, 0);
    assert_eq!(access.pool_stats().retired, 1);
    access.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reads_fail_over_and_health_check_restores_primary() {
    let mut config = test_config();
    config.health_check_interval = Duration::from_secs(1);
    let (access, graph) = start(config).await;
    graph.seed(&Mutation::CreateEntity(doc("1", "a"))).unwrap();

    graph.set_endpoint_down("mem://primary", true);
    let entity = access.get_entity(&"1".into()).await.unwrap();
    assert!(entity.is_some());
    assert_eq!(
        access.health().unhealthy_endpoints,
        vec!["mem://primary".to_string()]
    );

    graph.set_endpoint_down("mem://primary", false);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(access.health().unhealthy_endpoints.is_empty());
    assert_eq!(access.pool_stats().endpoint_restores, 1);
    access.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn traversal_and_relationships_round_trip() {
    let (access, _) = start(test_config()).await;
    access
        .execute_batch(&[
            Mutation::CreateEntity(doc("1", "root")),
            Mutation::CreateEntity(doc("2", "child")),
            Mutation::CreateEntity(Entity::new("3", "Concept")),
            Mutation::CreateRelationship(Relationship::new("1", "2", "CITES")),
            Mutation::CreateRelationship(Relationship::new("2", "3", "MENTIONS")),
        ])
        .await
        .unwrap();

    let reached = access
        .traverse(&TraversalRequest::new("1", 2))
        .await
        .unwrap();
    let ids: Vec<&str> = reached.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["2", "3"]);

    let rels = access.relationships(&"2".into()).await.unwrap();
    assert_eq!(rels.len(), 2);

    // Removing an edge invalidates traversals that reached through it.
    access
        .delete_relationship("2".into(), "3".into(), "MENTIONS")
        .await
        .unwrap();
    let reached = access
        .traverse(&TraversalRequest::new("1", 2))
        .await
        .unwrap();
    assert_eq!(reached.len(), 1);

    access.delete_entity("3".into()).await.unwrap();
    assert_eq!(access.get_entity(&"3".into()).await.unwrap(), None);
    access.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn invalid_requests_are_query_errors() {
    let (access, _) = start(test_config()).await;
    let err = access
        .traverse(&TraversalRequest::new("1", 0))
        .await
        .unwrap_err();
    assert!(matches!(err, AccessError::Query(_)));

    let err = access
        .search(&SearchRequest::new("x").of_type("Bad Label"))
        .await
        .unwrap_err();
    assert!(matches!(err, AccessError::Query(_)));
    access.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn every_operation_is_monitored() {
    let sink = Arc::new(MemoryAlertSink::new());
    let monitor = PerformanceMonitor::new([AlertThreshold::new("get_entity", 10.0)], 64)
        .with_alert_sink(sink.clone())
        .with_memory_sampler(Arc::new(NoopSampler));
    let graph = MemoryGraph::new();
    let access = GraphAccess::start_with_monitor(test_config(), Arc::new(graph.clone()), monitor)
        .await
        .unwrap();
    let mut feed = access.subscribe_metrics();

    access.create_entity(doc("1", "a")).await.unwrap();
    assert!(access.create_entity(doc("1", "a")).await.is_err());

    graph.set_latency(Duration::from_millis(20));
    access.get_entity(&"1".into()).await.unwrap();

    let first = feed.recv().await.unwrap();
    assert_eq!(first.operation_type, "create_entity");
    assert!(first.success);

    let summary = access.metrics_summary();
    assert_eq!(summary.total_calls, 3);
    assert_eq!(summary.total_failures, 1);
    assert_eq!(summary.operations["create_entity"].error_rate_percent, 50.0);
    assert_eq!(summary.in_flight, 0);
    assert_eq!(sink.len(), 1);
    access.shutdown().await;
}

#[derive(Default)]
struct CountingSampler {
    refreshes: AtomicUsize,
}

impl MemorySampler for CountingSampler {
    fn resident_bytes(&self) -> Option<u64> {
        Some(64 * 1024 * 1024)
    }

    fn refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn memory_is_sampled_in_the_background_until_shutdown() {
    let sampler = Arc::new(CountingSampler::default());
    let config = AccessConfig {
        sample_memory: true,
        memory_sample_interval: Duration::from_millis(100),
        ..test_config()
    };
    let monitor = PerformanceMonitor::new(Vec::<AlertThreshold>::new(), 16)
        .with_memory_sampler(sampler.clone());
    let access = GraphAccess::start_with_monitor(config, Arc::new(MemoryGraph::new()), monitor)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(sampler.refreshes.load(Ordering::SeqCst) >= 3);

    access.create_entity(doc("1", "a")).await.unwrap();
    assert_eq!(access.metrics_summary().total_calls, 1);

    access.shutdown().await;
    let stopped_at = sampler.refreshes.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(sampler.refreshes.load(Ordering::SeqCst), stopped_at);
}

#[tokio::test(start_paused = true)]
async fn shutdown_refuses_further_work() {
    let (access, _) = start(test_config()).await;
    access.create_entity(doc("1", "a")).await.unwrap();
    access.get_entity(&"1".into()).await.unwrap();

    let summary = access.shutdown().await;
    assert_eq!(summary.total_calls, 2);

    let health = access.health();
    assert!(health.closed);
    assert_eq!(health.idle_count, 0);

    let err = access.get_entity(&"1".into()).await.unwrap_err();
    assert!(matches!(err, AccessError::ShuttingDown));
    let err = access
        .execute(&QuerySpec::new(cypher::PING))
        .await
        .unwrap_err();
    assert!(matches!(err, AccessError::ShuttingDown));

    // Idempotent.
    access.shutdown().await;
}

#[tokio::test]
async fn invalid_config_is_rejected_at_start() {
    let config = AccessConfig {
        max_pool_size: 0,
        ..test_config()
    };
    let err = GraphAccess::start(config, Arc::new(MemoryGraph::new()))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AccessError::Config(_)));
}
