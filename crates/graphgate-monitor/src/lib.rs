//! graphgate-monitor: operation instrumentation for the access layer.
//!
//! Every call path is wrapped by [`PerformanceMonitor::wrap`], which records
//! duration, process memory delta, success, and concurrency, compares the
//! result against per-operation thresholds, and feeds a bounded ring buffer
//! plus a broadcast channel for external collectors.

pub mod alert;
pub mod memory;
pub mod metric;
pub mod monitor;

pub use alert::{Alert, AlertSink, Breach, MemoryAlertSink, TracingAlertSink};
pub use memory::{MemorySampler, NoopSampler, ProcessMemorySampler};
pub use metric::{AlertThreshold, OperationMetric};
pub use monitor::{MonitorSummary, OperationSummary, PerformanceMonitor};
