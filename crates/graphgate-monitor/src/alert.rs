//! Alert delivery to external observability collaborators.

use parking_lot::Mutex;
use serde::Serialize;

use crate::metric::OperationMetric;

/// A single exceeded limit.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Breach {
    Duration { observed_ms: f64, limit_ms: f64 },
    Memory { observed_mb: f64, limit_mb: f64 },
}

/// An operation that exceeded at least one of its thresholds.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Alert {
    pub metric: OperationMetric,
    pub breaches: Vec<Breach>,
}

/// Receiver of threshold alerts. Implementations must not block: `emit` runs
/// on the caller's path right after the monitored operation returns.
pub trait AlertSink: Send + Sync {
    fn emit(&self, alert: &Alert);
}

/// Default sink: one structured `warn` event per alert.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn emit(&self, alert: &Alert) {
        for breach in &alert.breaches {
            match breach {
                Breach::Duration {
                    observed_ms,
                    limit_ms,
                } => tracing::warn!(
                    operation = %alert.metric.operation_type,
                    duration_ms = observed_ms,
                    limit_ms,
                    success = alert.metric.success,
                    concurrency = alert.metric.concurrency_at_start,
                    "Operation exceeded duration threshold"
                ),
                Breach::Memory {
                    observed_mb,
                    limit_mb,
                } => tracing::warn!(
                    operation = %alert.metric.operation_type,
                    memory_delta_mb = observed_mb,
                    limit_mb,
                    "Operation exceeded memory threshold"
                ),
            }
        }
    }
}

/// Sink that keeps every alert in memory, for tests and local inspection.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.lock().is_empty()
    }
}

impl AlertSink for MemoryAlertSink {
    fn emit(&self, alert: &Alert) {
        self.alerts.lock().push(alert.clone());
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn breach_serializes_with_kind_tag() {
        let alert = Alert {
            metric: OperationMetric {
                operation_type: "get_entity".into(),
                started_at: Utc::now(),
                duration_ms: 250.0,
                memory_delta_mb: 0.0,
                success: true,
                concurrency_at_start: 3,
            },
            breaches: vec![Breach::Duration {
                observed_ms: 250.0,
                limit_ms: 100.0,
            }],
        };
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["breaches"][0]["kind"], "duration");
        assert_eq!(json["metric"]["operation_type"], "get_entity");
    }

    #[test]
    fn memory_sink_collects() {
        let sink = MemoryAlertSink::new();
        assert!(sink.is_empty());
        sink.emit(&Alert {
            metric: OperationMetric {
                operation_type: "search".into(),
                started_at: Utc::now(),
                duration_ms: 1.0,
                memory_delta_mb: 99.0,
                success: false,
                concurrency_at_start: 1,
            },
            breaches: vec![],
        });
        assert_eq!(sink.len(), 1);
    }
}
