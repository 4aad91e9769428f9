//! graphgate-graph — pooled, cached, monitored access to the graph store.
//!
//! Every read and write from the content pipeline flows through
//! [`GraphAccess`]. Reads are answered from the tiered cache when possible
//! and otherwise run on a pooled session under a hard deadline; writes run
//! on a pooled session (batches in one transaction) and invalidate every
//! cached result tagged with an entity they touched.

pub mod access;
pub mod batch;
pub mod cypher;
pub mod executor;
pub mod memory;
pub mod neo4j;
pub mod pool;
pub mod query;
pub mod session;

pub use access::GraphAccess;
pub use batch::{BatchExecutor, BatchResult};
pub use executor::QueryExecutor;
pub use memory::MemoryGraph;
pub use neo4j::{Neo4jConnector, Neo4jSession};
pub use pool::{
    ConnectionPool, ConnectionState, MaintenanceReport, PoolConfig, PoolHealth, PoolStats,
    PooledConnection,
};
pub use query::{QueryResult, QuerySpec, Rows};
pub use session::{BackendError, GraphSession, SessionFactory};
