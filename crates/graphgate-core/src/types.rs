//! Core domain types for the graph access layer.
//!
//! The meaning of an entity or relationship belongs to the calling pipeline;
//! these types only carry what the access layer needs to route, cache, and
//! invalidate: ids, a type label, and an opaque property bag.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Identifiers ───────────────────────────────────────────────────

/// Identifier of an entity in the knowledge store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for EntityId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

// ── Entities & Relationships ─────────────────────────────────────

/// A node in the knowledge store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    /// Node label, e.g. "Document" or "Concept".
    pub entity_type: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Entity {
    pub fn new(id: impl Into<EntityId>, entity_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// A directed, typed edge between two entities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relationship {
    pub source: EntityId,
    pub target: EntityId,
    pub rel_type: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Relationship {
    pub fn new(
        source: impl Into<EntityId>,
        target: impl Into<EntityId>,
        rel_type: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            rel_type: rel_type.into(),
            properties: Map::new(),
        }
    }
}

/// A single write against the knowledge store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    CreateEntity(Entity),
    UpdateEntity(Entity),
    DeleteEntity {
        id: EntityId,
    },
    CreateRelationship(Relationship),
    DeleteRelationship {
        source: EntityId,
        target: EntityId,
        rel_type: String,
    },
}

impl Mutation {
    /// Entity ids whose cached reads become stale once this mutation lands.
    pub fn affected_ids(&self) -> Vec<EntityId> {
        match self {
            Self::CreateEntity(e) | Self::UpdateEntity(e) => vec![e.id.clone()],
            Self::DeleteEntity { id } => vec![id.clone()],
            Self::CreateRelationship(r) => vec![r.source.clone(), r.target.clone()],
            Self::DeleteRelationship { source, target, .. } => {
                vec![source.clone(), target.clone()]
            }
        }
    }

    /// Short operation name used in logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateEntity(_) => "create_entity",
            Self::UpdateEntity(_) => "update_entity",
            Self::DeleteEntity { .. } => "delete_entity",
            Self::CreateRelationship(_) => "create_relationship",
            Self::DeleteRelationship { .. } => "delete_relationship",
        }
    }
}

// ── Read Requests ────────────────────────────────────────────────

/// Full-text search with an optional type filter and pagination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchRequest {
    pub text: String,
    pub entity_type: Option<String>,
    #[serde(default)]
    pub offset: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

impl SearchRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            entity_type: None,
            offset: 0,
            limit: default_limit(),
        }
    }

    pub fn of_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    pub fn page(mut self, offset: u32, limit: u32) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }
}

fn default_limit() -> u32 {
    25
}

/// Bounded-depth walk from a start entity, optionally restricted to some
/// relationship types.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraversalRequest {
    pub start: EntityId,
    pub depth: u32,
    #[serde(default)]
    pub relationship_types: Vec<String>,
}

impl TraversalRequest {
    pub fn new(start: impl Into<EntityId>, depth: u32) -> Self {
        Self {
            start: start.into(),
            depth,
            relationship_types: Vec::new(),
        }
    }

    pub fn via(mut self, rel_type: impl Into<String>) -> Self {
        self.relationship_types.push(rel_type.into());
        self
    }
}

// ── Cache Tiers ──────────────────────────────────────────────────

/// The four independent cache tiers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    Node,
    Search,
    Relationship,
    Traversal,
}

impl TierKind {
    /// Lock acquisition order. Any path holding more than one tier lock takes
    /// them in this order.
    pub const LOCK_ORDER: [TierKind; 4] = [
        TierKind::Node,
        TierKind::Search,
        TierKind::Relationship,
        TierKind::Traversal,
    ];

    /// Spill-over order when the global memory budget is exceeded: lowest
    /// priority first.
    pub const EVICTION_ORDER: [TierKind; 4] = [
        TierKind::Traversal,
        TierKind::Search,
        TierKind::Relationship,
        TierKind::Node,
    ];

    /// Position in [`Self::LOCK_ORDER`].
    pub fn index(self) -> usize {
        match self {
            Self::Node => 0,
            Self::Search => 1,
            Self::Relationship => 2,
            Self::Traversal => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Search => "search",
            Self::Relationship => "relationship",
            Self::Traversal => "traversal",
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
