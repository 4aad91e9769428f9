//! The performance monitor wrapping every access-layer call path.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

use graphgate_core::AccessConfig;

use crate::alert::{Alert, AlertSink, TracingAlertSink};
use crate::memory::{MemorySampler, NoopSampler, ProcessMemorySampler};
use crate::metric::{AlertThreshold, OperationMetric};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const FEED_CAPACITY: usize = 256;

/// Aggregates for one operation type over the retained metrics window.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OperationSummary {
    pub calls: usize,
    pub failures: usize,
    pub error_rate_percent: f64,
    pub mean_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MonitorSummary {
    /// Lifetime counters.
    pub total_calls: u64,
    pub total_failures: u64,
    pub alerts_emitted: u64,
    pub in_flight: usize,
    /// Per-operation aggregates over the retained window.
    pub operations: BTreeMap<String, OperationSummary>,
}

/// Decrements the in-flight counter when the wrapped call ends, however it ends.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct PerformanceMonitor {
    thresholds: HashMap<String, AlertThreshold>,
    in_flight: AtomicUsize,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    alerts_emitted: AtomicU64,
    recent: Mutex<VecDeque<OperationMetric>>,
    capacity: usize,
    sink: Arc<dyn AlertSink>,
    sampler: Arc<dyn MemorySampler>,
    feed: broadcast::Sender<OperationMetric>,
}

impl PerformanceMonitor {
    /// Monitor with the tracing alert sink and process memory sampling.
    pub fn new(thresholds: impl IntoIterator<Item = AlertThreshold>, capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            thresholds: thresholds
                .into_iter()
                .map(|t| (t.operation_type.clone(), t))
                .collect(),
            in_flight: AtomicUsize::new(0),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            alerts_emitted: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            sink: Arc::new(TracingAlertSink),
            sampler: Arc::new(ProcessMemorySampler::new()),
            feed,
        }
    }

    pub fn from_config(config: &AccessConfig) -> Self {
        let thresholds = config
            .thresholds
            .iter()
            .map(|(op, t)| AlertThreshold::from_config(op, t));
        let monitor = Self::new(thresholds, config.metrics_buffer_size);
        if config.sample_memory {
            monitor
        } else {
            monitor.with_memory_sampler(Arc::new(NoopSampler))
        }
    }

    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_memory_sampler(mut self, sampler: Arc<dyn MemorySampler>) -> Self {
        self.sampler = sampler;
        self
    }

    /// The sampler `wrap` reads from, for the task that refreshes it.
    pub fn memory_sampler(&self) -> Arc<dyn MemorySampler> {
        self.sampler.clone()
    }

    /// Run `call`, record its metric, and hand its result back unchanged.
    ///
    /// The in-flight counter is released even if the future is dropped
    /// before completion; a cancelled call records no metric.
    pub async fn wrap<T, E, F>(&self, operation_type: &str, call: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let concurrency_at_start = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        let _guard = InFlightGuard(&self.in_flight);
        let started_at = Utc::now();
        let memory_before = self.sampler.resident_bytes();
        let clock = Instant::now();

        let result = call.await;

        let duration_ms = clock.elapsed().as_secs_f64() * 1000.0;
        let memory_delta_mb = match (memory_before, self.sampler.resident_bytes()) {
            (Some(before), Some(after)) => (after as f64 - before as f64) / BYTES_PER_MB,
            _ => 0.0,
        };

        self.record(OperationMetric {
            operation_type: operation_type.to_string(),
            started_at,
            duration_ms,
            memory_delta_mb,
            success: result.is_ok(),
            concurrency_at_start,
        });
        result
    }

    /// Check thresholds, retain, and publish a completed metric.
    pub fn record(&self, metric: OperationMetric) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if !metric.success {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(threshold) = self.thresholds.get(&metric.operation_type) {
            let breaches = threshold.check(&metric);
            if !breaches.is_empty() {
                self.alerts_emitted.fetch_add(1, Ordering::Relaxed);
                self.sink.emit(&Alert {
                    metric: metric.clone(),
                    breaches,
                });
            }
        }

        tracing::trace!(
            operation = %metric.operation_type,
            duration_ms = metric.duration_ms,
            success = metric.success,
            "Operation recorded"
        );

        // No subscribers is fine.
        let _ = self.feed.send(metric.clone());

        let mut recent = self.recent.lock();
        if recent.len() == self.capacity {
            recent.pop_front();
        }
        recent.push_back(metric);
    }

    /// Receive every metric recorded from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<OperationMetric> {
        self.feed.subscribe()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Retained metrics, oldest first.
    pub fn recent(&self) -> Vec<OperationMetric> {
        self.recent.lock().iter().cloned().collect()
    }

    pub fn threshold(&self, operation_type: &str) -> Option<&AlertThreshold> {
        self.thresholds.get(operation_type)
    }

    pub fn summary(&self) -> MonitorSummary {
        let mut durations: BTreeMap<String, (Vec<f64>, usize)> = BTreeMap::new();
        for metric in self.recent.lock().iter() {
            let entry = durations
                .entry(metric.operation_type.clone())
                .or_default();
            entry.0.push(metric.duration_ms);
            if !metric.success {
                entry.1 += 1;
            }
        }

        let operations = durations
            .into_iter()
            .map(|(op, (samples, failures))| (op, summarize(samples, failures)))
            .collect();

        MonitorSummary {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            alerts_emitted: self.alerts_emitted.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
            operations,
        }
    }

    /// Log the final summary and drop retained metrics.
    pub fn flush(&self) -> MonitorSummary {
        let summary = self.summary();
        for (op, s) in &summary.operations {
            tracing::info!(
                operation = %op,
                calls = s.calls,
                failures = s.failures,
                error_rate_percent = s.error_rate_percent,
                mean_ms = s.mean_ms,
                p95_ms = s.p95_ms,
                max_ms = s.max_ms,
                "Operation summary"
            );
        }
        tracing::info!(
            total_calls = summary.total_calls,
            total_failures = summary.total_failures,
            alerts = summary.alerts_emitted,
            "Monitor flushed"
        );
        self.recent.lock().clear();
        summary
    }
}

fn summarize(mut samples: Vec<f64>, failures: usize) -> OperationSummary {
    let calls = samples.len();
    samples.sort_by(|a, b| a.total_cmp(b));
    let mean_ms = samples.iter().sum::<f64>() / calls as f64;
    // Nearest-rank percentile.
    let rank = ((calls as f64) * 0.95).ceil() as usize;
    let p95_ms = samples[rank.clamp(1, calls) - 1];
    OperationSummary {
        calls,
        failures,
        error_rate_percent: failures as f64 / calls as f64 * 100.0,
        mean_ms,
        p95_ms,
        max_ms: samples[calls - 1],
    }
}
