//! Backend session abstraction managed by the connection pool.
//!
//! A session is one live connection to one endpoint. The pool treats it as
//! opaque: it only opens, pings, hands out, and drops sessions. Executors
//! drive reads and transactional writes through the same trait.

use async_trait::async_trait;
use serde_json::Value;

use graphgate_core::Mutation;

use crate::query::QuerySpec;

/// Failure reported by a backend session.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BackendError {
    /// The connection or endpoint is unusable. Triggers failover.
    #[error("connection error: {0}")]
    Connection(String),

    /// The backend rejected or failed the statement.
    #[error("query error: {0}")]
    Query(String),

    /// A write violated a store constraint.
    #[error("constraint violation: {0}")]
    Constraint(String),
}

impl BackendError {
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// One live connection to the graph backend.
#[async_trait]
pub trait GraphSession: Send {
    /// Run a read statement and collect every row as a JSON object.
    async fn fetch(&mut self, spec: &QuerySpec) -> Result<Vec<Value>, BackendError>;

    /// Open a transaction. Later `apply` calls are staged until `commit`.
    async fn begin(&mut self) -> Result<(), BackendError>;

    /// Apply one mutation, inside the open transaction if there is one.
    async fn apply(&mut self, mutation: &Mutation) -> Result<(), BackendError>;

    async fn commit(&mut self) -> Result<(), BackendError>;

    async fn rollback(&mut self) -> Result<(), BackendError>;

    /// Cheap liveness check used by the health probe.
    async fn ping(&mut self) -> Result<(), BackendError>;
}

/// Opens sessions against a named endpoint.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn GraphSession>, BackendError>;
}

/// Stand-in left behind once a pooled session has been handed back.
pub(crate) struct DetachedSession;

#[async_trait]
impl GraphSession for DetachedSession {
    async fn fetch(&mut self, _spec: &QuerySpec) -> Result<Vec<Value>, BackendError> {
        Err(detached())
    }

    async fn begin(&mut self) -> Result<(), BackendError> {
        Err(detached())
    }

    async fn apply(&mut self, _mutation: &Mutation) -> Result<(), BackendError> {
        Err(detached())
    }

    async fn commit(&mut self) -> Result<(), BackendError> {
        Err(detached())
    }

    async fn rollback(&mut self) -> Result<(), BackendError> {
        Err(detached())
    }

    async fn ping(&mut self) -> Result<(), BackendError> {
        Err(detached())
    }
}

fn detached() -> BackendError {
    BackendError::Connection("session already returned to the pool".into())
}
