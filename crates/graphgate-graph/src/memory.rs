//! In-memory graph backend.
//!
//! Understands the statements built by [`crate::cypher`], stages writes per
//! transaction with the same constraints a real store enforces (duplicate
//! create, missing update target, dangling relationship), and can simulate
//! slow queries and endpoint outages. Used for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use graphgate_core::{Entity, EntityId, Mutation, Relationship};

use crate::cypher;
use crate::query::QuerySpec;
use crate::session::{BackendError, GraphSession, SessionFactory};

type Handler = Arc<dyn Fn(&QuerySpec) -> Result<Vec<Value>, BackendError> + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct Store {
    entities: BTreeMap<EntityId, Entity>,
    relationships: Vec<Relationship>,
}

impl Store {
    fn apply(&mut self, mutation: &Mutation) -> Result<(), BackendError> {
        match mutation {
            Mutation::CreateEntity(e) => {
                cypher::validate_identifier(&e.entity_type)?;
                if self.entities.contains_key(&e.id) {
                    return Err(BackendError::Constraint(format!(
                        "entity {} already exists",
                        e.id
                    )));
                }
                self.entities.insert(e.id.clone(), e.clone());
            }
            Mutation::UpdateEntity(e) => {
                let existing = self.entities.get_mut(&e.id).ok_or_else(|| {
                    BackendError::Constraint(format!("entity {} does not exist", e.id))
                })?;
                for (k, v) in &e.properties {
                    existing.properties.insert(k.clone(), v.clone());
                }
            }
            Mutation::DeleteEntity { id } => {
                self.entities.remove(id);
                self.relationships
                    .retain(|r| &r.source != id && &r.target != id);
            }
            Mutation::CreateRelationship(r) => {
                cypher::validate_identifier(&r.rel_type)?;
                if !self.entities.contains_key(&r.source) || !self.entities.contains_key(&r.target)
                {
                    return Err(BackendError::Constraint(format!(
                        "relationship endpoints {} and {} must both exist",
                        r.source, r.target
                    )));
                }
                match self.relationships.iter_mut().find(|x| {
                    x.source == r.source && x.target == r.target && x.rel_type == r.rel_type
                }) {
                    Some(existing) => existing.properties.extend(r.properties.clone()),
                    None => self.relationships.push(r.clone()),
                }
            }
            Mutation::DeleteRelationship {
                source,
                target,
                rel_type,
            } => {
                cypher::validate_identifier(rel_type)?;
                self.relationships.retain(|r| {
                    !(&r.source == source && &r.target == target && &r.rel_type == rel_type)
                });
            }
        }
        Ok(())
    }

    fn entity_row(entity: &Entity) -> Result<Value, BackendError> {
        serde_json::to_value(entity).map_err(|e| BackendError::Query(e.to_string()))
    }

    fn get_entity(&self, spec: &QuerySpec) -> Result<Vec<Value>, BackendError> {
        let id = required_str(spec, "id")?;
        self.entities
            .get(&EntityId::new(id))
            .map(Self::entity_row)
            .into_iter()
            .collect()
    }

    fn search(&self, spec: &QuerySpec) -> Result<Vec<Value>, BackendError> {
        let needle = required_str(spec, "text")?.to_lowercase();
        let entity_type = spec.str_param("entity_type");
        let offset = spec.u64_param("offset").unwrap_or(0) as usize;
        let limit = spec.u64_param("limit").unwrap_or(u64::MAX) as usize;

        self.entities
            .values()
            .filter(|e| entity_type.map_or(true, |t| e.entity_type == t))
            .filter(|e| {
                e.id.as_str().to_lowercase().contains(&needle)
                    || e.properties.values().any(|v| {
                        let text = match v {
                            Value::String(s) => s.to_lowercase(),
                            other => other.to_string().to_lowercase(),
                        };
                        text.contains(&needle)
                    })
            })
            .skip(offset)
            .take(limit)
            .map(Self::entity_row)
            .collect()
    }

    fn relationships(&self, spec: &QuerySpec) -> Result<Vec<Value>, BackendError> {
        let id = EntityId::new(required_str(spec, "id")?);
        let mut rows: Vec<&Relationship> = self
            .relationships
            .iter()
            .filter(|r| r.source == id || r.target == id)
            .collect();
        rows.sort_by(|a, b| {
            (&a.source, &a.target, &a.rel_type).cmp(&(&b.source, &b.target, &b.rel_type))
        });
        rows.into_iter()
            .map(|r| serde_json::to_value(r).map_err(|e| BackendError::Query(e.to_string())))
            .collect()
    }

    /// Undirected breadth-first walk, start excluded, ordered by id.
    fn traverse(&self, spec: &QuerySpec) -> Result<Vec<Value>, BackendError> {
        let start = EntityId::new(required_str(spec, "start")?);
        let depth = spec
            .u64_param("depth")
            .ok_or_else(|| BackendError::Query("missing parameter: depth".into()))?;
        let rel_types: HashSet<&str> = spec
            .parameters
            .get("rel_types")
            .and_then(Value::as_array)
            .map(|types| types.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        if !self.entities.contains_key(&start) {
            return Ok(Vec::new());
        }

        let mut seen: BTreeSet<&EntityId> = BTreeSet::from([&start]);
        let mut frontier: VecDeque<(&EntityId, u64)> = VecDeque::from([(&start, 0)]);
        while let Some((node, d)) = frontier.pop_front() {
            if d == depth {
                continue;
            }
            for r in &self.relationships {
                if !rel_types.is_empty() && !rel_types.contains(r.rel_type.as_str()) {
                    continue;
                }
                let next = if &r.source == node {
                    &r.target
                } else if &r.target == node {
                    &r.source
                } else {
                    continue;
                };
                if seen.insert(next) {
                    frontier.push_back((next, d + 1));
                }
            }
        }

        seen.into_iter()
            .filter(|id| **id != start)
            .filter_map(|id| self.entities.get(id))
            .map(Self::entity_row)
            .collect()
    }
}

fn required_str<'a>(spec: &'a QuerySpec, key: &str) -> Result<&'a str, BackendError> {
    spec.str_param(key)
        .ok_or_else(|| BackendError::Query(format!("missing parameter: {key}")))
}

struct Shared {
    store: Mutex<Store>,
    latency: Mutex<Duration>,
    down: Mutex<HashSet<String>>,
    handlers: Mutex<HashMap<String, Handler>>,
    sessions_opened: AtomicUsize,
}

/// Shared in-memory store; every session opened from it sees the same data.
#[derive(Clone)]
pub struct MemoryGraph {
    shared: Arc<Shared>,
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                store: Mutex::new(Store::default()),
                latency: Mutex::new(Duration::ZERO),
                down: Mutex::new(HashSet::new()),
                handlers: Mutex::new(HashMap::new()),
                sessions_opened: AtomicUsize::new(0),
            }),
        }
    }

    /// Delay before a read or write is acknowledged. The read snapshot is
    /// taken, or the write applied, before the delay starts.
    pub fn set_latency(&self, latency: Duration) {
        *self.shared.latency.lock() = latency;
    }

    /// Simulate an outage: connects and calls on `endpoint` fail with a
    /// connection error until it is brought back up.
    pub fn set_endpoint_down(&self, endpoint: &str, down: bool) {
        let mut set = self.shared.down.lock();
        if down {
            set.insert(endpoint.to_string());
        } else {
            set.remove(endpoint);
        }
    }

    /// Answer statements with text `text` using `handler`.
    pub fn on_query<F>(&self, text: impl Into<String>, handler: F)
    where
        F: Fn(&QuerySpec) -> Result<Vec<Value>, BackendError> + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .lock()
            .insert(text.into(), Arc::new(handler));
    }

    /// Apply a mutation directly, bypassing sessions.
    pub fn seed(&self, mutation: &Mutation) -> Result<(), BackendError> {
        self.shared.store.lock().apply(mutation)
    }

    pub fn entity(&self, id: &EntityId) -> Option<Entity> {
        self.shared.store.lock().entities.get(id).cloned()
    }

    pub fn entity_count(&self) -> usize {
        self.shared.store.lock().entities.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.shared.store.lock().relationships.len()
    }

    pub fn sessions_opened(&self) -> usize {
        self.shared.sessions_opened.load(Ordering::Relaxed)
    }

    fn check_endpoint(&self, endpoint: &str) -> Result<(), BackendError> {
        if self.shared.down.lock().contains(endpoint) {
            Err(BackendError::Connection(format!("{endpoint} is unreachable")))
        } else {
            Ok(())
        }
    }

    async fn acknowledge(&self) {
        let latency = *self.shared.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn read(&self, spec: &QuerySpec) -> Result<Vec<Value>, BackendError> {
        let handler = self.shared.handlers.lock().get(&spec.text).cloned();
        if let Some(handler) = handler {
            return handler(spec);
        }

        let store = self.shared.store.lock();
        match spec.text.as_str() {
            cypher::PING => Ok(vec![serde_json::json!({"ok": 1})]),
            cypher::GET_ENTITY => store.get_entity(spec),
            cypher::SEARCH_ENTITIES => store.search(spec),
            cypher::RELATIONSHIPS => store.relationships(spec),
            text if text.starts_with(cypher::TRAVERSE_PREFIX) => store.traverse(spec),
            text => Err(BackendError::Query(format!("unsupported statement: {text}"))),
        }
    }
}

#[async_trait]
impl SessionFactory for MemoryGraph {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn GraphSession>, BackendError> {
        self.check_endpoint(endpoint)?;
        self.shared.sessions_opened.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemorySession {
            graph: self.clone(),
            endpoint: endpoint.to_string(),
            staged: None,
        }))
    }
}

/// A transaction in progress: a private view for constraint checks plus the
/// mutations to replay against the live store on commit.
struct Staged {
    view: Store,
    log: Vec<Mutation>,
}

pub struct MemorySession {
    graph: MemoryGraph,
    endpoint: String,
    staged: Option<Staged>,
}

#[async_trait]
impl GraphSession for MemorySession {
    async fn fetch(&mut self, spec: &QuerySpec) -> Result<Vec<Value>, BackendError> {
        self.graph.check_endpoint(&self.endpoint)?;
        let rows = self.graph.read(spec);
        self.graph.acknowledge().await;
        rows
    }

    async fn begin(&mut self) -> Result<(), BackendError> {
        self.graph.check_endpoint(&self.endpoint)?;
        if self.staged.is_some() {
            return Err(BackendError::Query("transaction already open".into()));
        }
        self.staged = Some(Staged {
            view: self.graph.shared.store.lock().clone(),
            log: Vec::new(),
        });
        Ok(())
    }

    async fn apply(&mut self, mutation: &Mutation) -> Result<(), BackendError> {
        self.graph.check_endpoint(&self.endpoint)?;
        let applied = match &mut self.staged {
            Some(staged) => staged.view.apply(mutation).map(|()| {
                staged.log.push(mutation.clone());
            }),
            None => self.graph.shared.store.lock().apply(mutation),
        };
        self.graph.acknowledge().await;
        applied
    }

    async fn commit(&mut self) -> Result<(), BackendError> {
        self.graph.check_endpoint(&self.endpoint)?;
        let staged = self
            .staged
            .take()
            .ok_or_else(|| BackendError::Query("no open transaction".into()))?;

        // Replay on a copy of the live store so a conflicting commit from
        // another session fails as a whole.
        {
            let mut store = self.graph.shared.store.lock();
            let mut next = store.clone();
            for m in &staged.log {
                next.apply(m)?;
            }
            *store = next;
        }
        self.graph.acknowledge().await;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), BackendError> {
        self.staged = None;
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), BackendError> {
        self.graph.check_endpoint(&self.endpoint)
    }
}
