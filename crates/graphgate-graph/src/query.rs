//! Parameterized read specs and their results.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use graphgate_cache::cache_key;
use graphgate_core::{EntityId, TierKind};

/// Row keys whose values name entities. Cached results are tagged with every
/// id found under these keys, in the rows and in the parameters.
const ID_KEYS: [&str; 4] = ["id", "start", "source", "target"];

/// Opaque, parameterized read passed through to the backend.
///
/// Rows are streamed in batches of the configured `fetch_size`, which the
/// backend session fixes per connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuerySpec {
    pub text: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// Cache tier for the result. `None` skips the cache entirely.
    #[serde(default)]
    pub target_tier: Option<TierKind>,
    /// Overrides the configured query timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl QuerySpec {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parameters: BTreeMap::new(),
            target_tier: None,
            timeout_ms: None,
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn cached_in(mut self, tier: TierKind) -> Self {
        self.target_tier = Some(tier);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Deterministic key over text and parameters. Tier and timeout do not
    /// take part.
    pub fn cache_key(&self) -> serde_json::Result<String> {
        cache_key(&self.text, &self.parameters)
    }

    /// String parameter lookup.
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    pub fn u64_param(&self, key: &str) -> Option<u64> {
        self.parameters.get(key).and_then(Value::as_u64)
    }
}

/// Rows returned by a read, shared with the cache.
pub type Rows = Arc<Vec<Value>>;

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub rows: Rows,
    pub from_cache: bool,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Entity ids a result depends on: ids in the parameters (so an empty
/// lookup is invalidated when the entity appears) plus every id in the rows.
pub fn touched_ids(spec: &QuerySpec, rows: &[Value]) -> Vec<EntityId> {
    let mut ids = BTreeSet::new();
    for key in ID_KEYS {
        if let Some(v) = spec.parameters.get(key) {
            collect_scalar(v, &mut ids);
        }
    }
    for row in rows {
        collect_ids(row, &mut ids);
    }
    ids.into_iter().collect()
}

fn collect_ids(value: &Value, ids: &mut BTreeSet<EntityId>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                if ID_KEYS.contains(&k.as_str()) {
                    collect_scalar(v, ids);
                }
                collect_ids(v, ids);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_ids(v, ids)),
        _ => {}
    }
}

fn collect_scalar(value: &Value, ids: &mut BTreeSet<EntityId>) {
    match value {
        Value::String(s) => {
            ids.insert(EntityId::new(s.as_str()));
        }
        Value::Number(n) => {
            ids.insert(EntityId::new(n.to_string()));
        }
        _ => {}
    }
}
