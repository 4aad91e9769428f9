//! Cypher statements for entity reads and writes.
//!
//! Values always travel as parameters. Labels, relationship types, and
//! traversal depth cannot be parameterized in Cypher, so they are validated
//! before being formatted into statement text.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use graphgate_core::{EntityId, Mutation, SearchRequest, TierKind, TraversalRequest};

use crate::query::QuerySpec;
use crate::session::BackendError;

/// Deepest traversal accepted.
pub const MAX_TRAVERSAL_DEPTH: u32 = 10;

// ── Read Statements ──────────────────────────────────────────────

pub const PING: &str = "RETURN 1 AS ok";

pub const GET_ENTITY: &str = "MATCH (n {id: $id}) \
     RETURN n.id AS id, labels(n)[0] AS entity_type, properties(n) AS properties";

pub const SEARCH_ENTITIES: &str = "MATCH (n) \
     WHERE ($entity_type IS NULL OR $entity_type IN labels(n)) \
       AND any(k IN keys(n) WHERE toLower(toString(n[k])) CONTAINS toLower($text)) \
     RETURN n.id AS id, labels(n)[0] AS entity_type, properties(n) AS properties \
     ORDER BY id SKIP $offset LIMIT $limit";

pub const RELATIONSHIPS: &str = "MATCH (n {id: $id})-[r]-() \
     RETURN DISTINCT startNode(r).id AS source, endNode(r).id AS target, \
       type(r) AS rel_type, properties(r) AS properties \
     ORDER BY source, target, rel_type";

/// Every traversal statement starts with this prefix followed by its depth.
pub const TRAVERSE_PREFIX: &str = "MATCH p = (s {id: $start})-[*1..";

const TRAVERSE_SUFFIX: &str = "]-(n) \
     WHERE n <> s AND all(r IN relationships(p) WHERE size($rel_types) = 0 OR type(r) IN $rel_types) \
     RETURN DISTINCT n.id AS id, labels(n)[0] AS entity_type, properties(n) AS properties \
     ORDER BY id";

pub fn get_entity(id: &EntityId) -> QuerySpec {
    QuerySpec::new(GET_ENTITY)
        .param("id", id.as_str())
        .cached_in(TierKind::Node)
}

pub fn search(request: &SearchRequest) -> Result<QuerySpec, BackendError> {
    if let Some(t) = &request.entity_type {
        validate_identifier(t)?;
    }
    Ok(QuerySpec::new(SEARCH_ENTITIES)
        .param("text", request.text.as_str())
        .param(
            "entity_type",
            request
                .entity_type
                .as_deref()
                .map_or(Value::Null, Value::from),
        )
        .param("offset", request.offset)
        .param("limit", request.limit)
        .cached_in(TierKind::Search))
}

pub fn traverse(request: &TraversalRequest) -> Result<QuerySpec, BackendError> {
    if request.depth == 0 || request.depth > MAX_TRAVERSAL_DEPTH {
        return Err(BackendError::Query(format!(
            "traversal depth must be between 1 and {MAX_TRAVERSAL_DEPTH}, got {}",
            request.depth
        )));
    }
    for rel in &request.relationship_types {
        validate_identifier(rel)?;
    }
    let text = format!("{TRAVERSE_PREFIX}{}{TRAVERSE_SUFFIX}", request.depth);
    Ok(QuerySpec::new(text)
        .param("start", request.start.as_str())
        .param("depth", request.depth)
        .param("rel_types", json!(request.relationship_types))
        .cached_in(TierKind::Traversal))
}

pub fn relationships(id: &EntityId) -> QuerySpec {
    QuerySpec::new(RELATIONSHIPS)
        .param("id", id.as_str())
        .cached_in(TierKind::Relationship)
}

// ── Write Statements ─────────────────────────────────────────────

/// A write statement and whether it must match something to count as applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub text: String,
    pub parameters: BTreeMap<String, Value>,
    /// When set, an empty result means the target did not exist.
    pub requires_match: Option<String>,
}

impl Statement {
    fn new(text: String) -> Self {
        Self {
            text,
            parameters: BTreeMap::new(),
            requires_match: None,
        }
    }

    fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    fn must_match(mut self, what: String) -> Self {
        self.requires_match = Some(what);
        self
    }
}

pub fn mutation(m: &Mutation) -> Result<Statement, BackendError> {
    let stmt = match m {
        Mutation::CreateEntity(e) => {
            let label = validate_identifier(&e.entity_type)?;
            Statement::new(format!(
                "CREATE (n:{label} {{id: $id}}) SET n += $properties RETURN n.id AS id"
            ))
            .param("id", e.id.as_str())
            .param("properties", Value::Object(e.properties.clone()))
        }
        Mutation::UpdateEntity(e) => Statement::new(
            "MATCH (n {id: $id}) SET n += $properties RETURN n.id AS id".to_string(),
        )
        .param("id", e.id.as_str())
        .param("properties", Value::Object(e.properties.clone()))
        .must_match(format!("entity {} does not exist", e.id)),
        Mutation::DeleteEntity { id } => {
            Statement::new("MATCH (n {id: $id}) DETACH DELETE n".to_string())
                .param("id", id.as_str())
        }
        Mutation::CreateRelationship(r) => {
            let rel = validate_identifier(&r.rel_type)?;
            Statement::new(format!(
                "MATCH (a {{id: $source}}), (b {{id: $target}}) \
                 MERGE (a)-[r:{rel}]->(b) SET r += $properties \
                 RETURN type(r) AS rel_type"
            ))
            .param("source", r.source.as_str())
            .param("target", r.target.as_str())
            .param("properties", Value::Object(r.properties.clone()))
            .must_match(format!(
                "relationship endpoints {} and {} must both exist",
                r.source, r.target
            ))
        }
        Mutation::DeleteRelationship {
            source,
            target,
            rel_type,
        } => {
            let rel = validate_identifier(rel_type)?;
            Statement::new(format!(
                "MATCH (a {{id: $source}})-[r:{rel}]->(b {{id: $target}}) DELETE r"
            ))
            .param("source", source.as_str())
            .param("target", target.as_str())
        }
    };
    Ok(stmt)
}

/// Accept `[A-Za-z_][A-Za-z0-9_]*` only.
pub fn validate_identifier(ident: &str) -> Result<&str, BackendError> {
    let mut chars = ident.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(ident)
    } else {
        Err(BackendError::Query(format!(
            "invalid label or relationship type: {ident:?}"
        )))
    }
}
