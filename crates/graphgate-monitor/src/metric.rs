//! Recorded operation metrics and the thresholds they are checked against.

use chrono::{DateTime, Utc};
use serde::Serialize;

use graphgate_core::ThresholdConfig;

use crate::alert::Breach;

/// One completed, monitored operation. Immutable once recorded.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OperationMetric {
    pub operation_type: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
    /// Process resident memory growth across the call, in MiB. Negative when
    /// memory was released; zero when sampling is disabled.
    pub memory_delta_mb: f64,
    pub success: bool,
    /// Operations already in flight when this one started (itself included).
    pub concurrency_at_start: usize,
}

/// Alert limits for one operation type.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AlertThreshold {
    pub operation_type: String,
    pub max_duration_ms: f64,
    pub max_memory_delta_mb: Option<f64>,
}

impl AlertThreshold {
    pub fn new(operation_type: impl Into<String>, max_duration_ms: f64) -> Self {
        Self {
            operation_type: operation_type.into(),
            max_duration_ms,
            max_memory_delta_mb: None,
        }
    }

    pub fn with_memory_limit(mut self, max_memory_delta_mb: f64) -> Self {
        self.max_memory_delta_mb = Some(max_memory_delta_mb);
        self
    }

    pub fn from_config(operation_type: &str, config: &ThresholdConfig) -> Self {
        Self {
            operation_type: operation_type.to_string(),
            max_duration_ms: config.max_duration.as_secs_f64() * 1000.0,
            max_memory_delta_mb: config.max_memory_delta,
        }
    }

    /// Limits `metric` exceeds, if any.
    pub fn check(&self, metric: &OperationMetric) -> Vec<Breach> {
        let mut breaches = Vec::new();
        if metric.duration_ms > self.max_duration_ms {
            breaches.push(Breach::Duration {
                observed_ms: metric.duration_ms,
                limit_ms: self.max_duration_ms,
            });
        }
        if let Some(limit_mb) = self.max_memory_delta_mb {
            if metric.memory_delta_mb > limit_mb {
                breaches.push(Breach::Memory {
                    observed_mb: metric.memory_delta_mb,
                    limit_mb,
                });
            }
        }
        breaches
    }
}
