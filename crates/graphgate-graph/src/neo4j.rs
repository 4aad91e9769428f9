//! Neo4j sessions over `neo4rs`.
//!
//! Each pooled session owns a single-connection `Graph`, so the access
//! layer's pool (not the driver's) decides how many connections exist and
//! which endpoint they point at.

use std::collections::BTreeMap;

use async_trait::async_trait;
use neo4rs::{
    query, BoltList, BoltMap, BoltNull, BoltString, BoltType, ConfigBuilder, Graph, Query, Txn,
};
use serde_json::Value;

use graphgate_core::{AccessConfig, Mutation};

use crate::cypher;
use crate::query::QuerySpec;
use crate::session::{BackendError, GraphSession, SessionFactory};

/// Opens [`Neo4jSession`]s with shared credentials.
#[derive(Clone)]
pub struct Neo4jConnector {
    user: String,
    password: String,
    fetch_size: usize,
    encrypted: bool,
}

impl std::fmt::Debug for Neo4jConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Neo4jConnector")
            .field("user", &self.user)
            .field("fetch_size", &self.fetch_size)
            .field("encrypted", &self.encrypted)
            .finish_non_exhaustive()
    }
}

impl Neo4jConnector {
    pub fn new(config: &AccessConfig) -> Self {
        Self {
            user: config.user.clone(),
            password: config.password.clone(),
            fetch_size: config.fetch_size,
            encrypted: config.encrypted,
        }
    }

    /// Rows pulled per round trip on every stream of every session. neo4rs
    /// fixes this per connection.
    pub fn fetch_size(&self) -> usize {
        self.fetch_size
    }

    /// Endpoint URI with the TLS scheme applied when encryption is on.
    pub fn endpoint_uri(&self, endpoint: &str) -> String {
        if !self.encrypted {
            return endpoint.to_string();
        }
        for scheme in ["bolt", "neo4j"] {
            if let Some(rest) = endpoint.strip_prefix(&format!("{scheme}://")) {
                return format!("{scheme}+s://{rest}");
            }
        }
        endpoint.to_string()
    }
}

#[async_trait]
impl SessionFactory for Neo4jConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn GraphSession>, BackendError> {
        let uri = self.endpoint_uri(endpoint);
        let config = ConfigBuilder::default()
            .uri(&uri)
            .user(&self.user)
            .password(&self.password)
            .max_connections(1)
            .fetch_size(self.fetch_size)
            .build()
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        let graph = Graph::connect(config)
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        tracing::debug!(endpoint = %uri, "Opened Neo4j session");
        Ok(Box::new(Neo4jSession { graph, txn: None }))
    }
}

pub struct Neo4jSession {
    graph: Graph,
    txn: Option<Txn>,
}

impl Neo4jSession {
    async fn collect(&self, q: Query) -> Result<Vec<Value>, BackendError> {
        let mut stream = self.graph.execute(q).await.map_err(classify)?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next().await.map_err(classify)? {
            let value: Value = row
                .to()
                .map_err(|e| BackendError::Query(format!("cannot decode row: {e}")))?;
            rows.push(value);
        }
        Ok(rows)
    }
}

#[async_trait]
impl GraphSession for Neo4jSession {
    async fn fetch(&mut self, spec: &QuerySpec) -> Result<Vec<Value>, BackendError> {
        self.collect(build_query(&spec.text, &spec.parameters)).await
    }

    async fn begin(&mut self) -> Result<(), BackendError> {
        if self.txn.is_some() {
            return Err(BackendError::Query("transaction already open".into()));
        }
        self.txn = Some(self.graph.start_txn().await.map_err(classify)?);
        Ok(())
    }

    async fn apply(&mut self, mutation: &Mutation) -> Result<(), BackendError> {
        let stmt = cypher::mutation(mutation)?;
        let q = build_query(&stmt.text, &stmt.parameters);

        let matched = match &mut self.txn {
            Some(txn) => {
                let mut stream = txn.execute(q).await.map_err(classify)?;
                stream.next(txn.handle()).await.map_err(classify)?.is_some()
            }
            None => {
                let mut stream = self.graph.execute(q).await.map_err(classify)?;
                stream.next().await.map_err(classify)?.is_some()
            }
        };

        match stmt.requires_match {
            Some(reason) if !matched => Err(BackendError::Constraint(reason)),
            _ => Ok(()),
        }
    }

    async fn commit(&mut self) -> Result<(), BackendError> {
        let txn = self
            .txn
            .take()
            .ok_or_else(|| BackendError::Query("no open transaction".into()))?;
        txn.commit().await.map_err(classify)
    }

    async fn rollback(&mut self) -> Result<(), BackendError> {
        match self.txn.take() {
            Some(txn) => txn.rollback().await.map_err(classify),
            None => Ok(()),
        }
    }

    async fn ping(&mut self) -> Result<(), BackendError> {
        self.collect(query(cypher::PING)).await.map(|_| ())
    }
}

fn build_query(text: &str, parameters: &BTreeMap<String, Value>) -> Query {
    parameters
        .iter()
        .fold(query(text), |q, (k, v)| q.param(k, to_bolt(v)))
}

/// JSON to Bolt. Numbers that fit `i64` stay integers.
fn to_bolt(value: &Value) -> BoltType {
    match value {
        Value::Null => BoltType::Null(BoltNull),
        Value::Bool(b) => BoltType::from(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => BoltType::from(i),
            None => BoltType::from(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => BoltType::from(s.clone()),
        Value::Array(items) => BoltType::List(BoltList {
            value: items.iter().map(to_bolt).collect(),
        }),
        Value::Object(map) => BoltType::Map(BoltMap {
            value: map
                .iter()
                .map(|(k, v)| (BoltString::new(k), to_bolt(v)))
                .collect(),
        }),
    }
}

fn classify(err: neo4rs::Error) -> BackendError {
    match err {
        neo4rs::Error::IOError { .. } | neo4rs::Error::ConnectionError => {
            BackendError::Connection(err.to_string())
        }
        other => {
            let message = other.to_string();
            if message.contains("ConstraintValidationFailed") {
                BackendError::Constraint(message)
            } else {
                BackendError::Query(message)
            }
        }
    }
}
