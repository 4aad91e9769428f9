use thiserror::Error;

/// Errors surfaced by the graph access layer.
///
/// An oversized cache entry is deliberately absent: it bypasses the cache and
/// never reaches the caller as a failure.
#[derive(Error, Debug)]
pub enum AccessError {
    #[error("Connection pool exhausted: no connection freed up within {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    #[error("Connection failure on {endpoint}: {reason}")]
    ConnectionFailure { endpoint: String, reason: String },

    #[error("Backend unavailable: all endpoints unhealthy ({})", endpoints.join(", "))]
    BackendUnavailable { endpoints: Vec<String> },

    #[error("Query exceeded its {timeout_ms}ms deadline")]
    QueryTimeout { timeout_ms: u64 },

    #[error("Query error: {0}")]
    Query(String),

    #[error("Batch failed and was rolled back: {reason}")]
    BatchFailed { reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Access layer is shutting down")]
    ShuttingDown,
}

impl AccessError {
    /// Whether a caller may reasonably retry the same request with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. } | Self::QueryTimeout { .. } | Self::BackendUnavailable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AccessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_unavailable_lists_endpoints() {
        let err = AccessError::BackendUnavailable {
            endpoints: vec!["bolt://a:7687".into(), "bolt://b:7687".into()],
        };
        assert_eq!(
            err.to_string(),
            "Backend unavailable: all endpoints unhealthy (bolt://a:7687, bolt://b:7687)"
        );
    }

    #[test]
    fn batch_failure_is_not_retryable() {
        assert!(!AccessError::BatchFailed {
            reason: "constraint".into()
        }
        .is_retryable());
        assert!(AccessError::PoolExhausted { waited_ms: 100 }.is_retryable());
    }
}
