//! Access-layer tests against a live Neo4j instance.
//!
//! Run with: cargo test --package graphgate-graph --test neo4j_live -- --ignored
//!
//! Reads `GRAPHGATE__*` overrides (e.g. `GRAPHGATE__PASSWORD`) and skips
//! when Neo4j is not reachable.

use std::sync::Arc;

use graphgate_core::{AccessConfig, Entity, EntityId, Mutation, Relationship, SearchRequest, TraversalRequest};
use graphgate_graph::{cypher, GraphAccess, Neo4jConnector, QuerySpec};

async fn connect_or_skip() -> Option<GraphAccess> {
    let config = AccessConfig::load("graphgate").unwrap_or_default();
    let connector = Arc::new(Neo4jConnector::new(&config));
    let access = match GraphAccess::start(config, connector).await {
        Ok(access) => access,
        Err(e) => {
            eprintln!("Skipping live test (bad config): {e}");
            return None;
        }
    };
    match access.execute(&QuerySpec::new(cypher::PING)).await {
        Ok(_) => Some(access),
        Err(e) => {
            eprintln!("Skipping live test (Neo4j not available): {e}");
            access.shutdown().await;
            None
        }
    }
}

fn unique(prefix: &str) -> EntityId {
    EntityId::new(format!("{prefix}-{}", uuid::Uuid::new_v4()))
}

async fn cleanup(access: &GraphAccess, ids: &[&EntityId]) {
    for id in ids {
        let _ = access.delete_entity((*id).clone()).await;
    }
}

#[tokio::test]
#[ignore = "requires live Neo4j"]
async fn create_read_update_delete() {
    let Some(access) = connect_or_skip().await else {
        return;
    };
    let id = unique("doc");

    access
        .create_entity(Entity::new(id.clone(), "Document").with_property("title", "Original"))
        .await
        .unwrap();
    let read = access.get_entity(&id).await.unwrap().unwrap();
    assert_eq!(read.properties["title"], "Original");

    access
        .update_entity(Entity::new(id.clone(), "Document").with_property("title", "Revised"))
        .await
        .unwrap();
    let read = access.get_entity(&id).await.unwrap().unwrap();
    assert_eq!(read.properties["title"], "Revised");

    access.delete_entity(id.clone()).await.unwrap();
    assert!(access.get_entity(&id).await.unwrap().is_none());
    access.shutdown().await;
}

#[tokio::test]
#[ignore = "requires live Neo4j"]
async fn batch_builds_a_traversable_subgraph() {
    let Some(access) = connect_or_skip().await else {
        return;
    };
    let (a, b, c) = (unique("a"), unique("b"), unique("c"));

    let result = access
        .execute_batch(&[
            Mutation::CreateEntity(Entity::new(a.clone(), "Document")),
            Mutation::CreateEntity(Entity::new(b.clone(), "Document")),
            Mutation::CreateEntity(Entity::new(c.clone(), "Concept")),
            Mutation::CreateRelationship(Relationship::new(a.clone(), b.clone(), "CITES")),
            Mutation::CreateRelationship(Relationship::new(b.clone(), c.clone(), "MENTIONS")),
        ])
        .await
        .unwrap();
    assert_eq!(result.applied, 5);

    let reached = access.traverse(&TraversalRequest::new(a.clone(), 2)).await.unwrap();
    assert_eq!(reached.len(), 2);

    let rels = access.relationships(&b).await.unwrap();
    assert_eq!(rels.len(), 2);

    cleanup(&access, &[&a, &b, &c]).await;
    access.shutdown().await;
}

#[tokio::test]
#[ignore = "requires live Neo4j"]
async fn failed_batch_leaves_no_trace() {
    let Some(access) = connect_or_skip().await else {
        return;
    };
    let (a, missing) = (unique("a"), unique("missing"));

    let err = access
        .execute_batch(&[
            Mutation::CreateEntity(Entity::new(a.clone(), "Document")),
            Mutation::UpdateEntity(Entity::new(missing.clone(), "Document")),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, graphgate_core::AccessError::BatchFailed { .. }), "{err}");
    assert!(access.get_entity(&a).await.unwrap().is_none());
    access.shutdown().await;
}

#[tokio::test]
#[ignore = "requires live Neo4j"]
async fn search_is_cached_until_invalidated() {
    let Some(access) = connect_or_skip().await else {
        return;
    };
    let id = unique("searchable");
    let marker = id.as_str().to_string();

    access
        .create_entity(Entity::new(id.clone(), "Document").with_property("title", marker.clone()))
        .await
        .unwrap();

    let spec = cypher::search(&SearchRequest::new(marker.clone())).unwrap();
    assert!(!access.execute(&spec).await.unwrap().from_cache);
    assert!(access.execute(&spec).await.unwrap().from_cache);

    access.delete_entity(id).await.unwrap();
    let after = access.execute(&spec).await.unwrap();
    assert!(!after.from_cache);
    assert!(after.is_empty());
    access.shutdown().await;
}
