/*!
# Metrics Collector

Counters, gauges, and bounded histograms for every coordination event, plus
the derived rates that drive the balancer and the alert channel.
*/

use crate::events::CoordinationEvent;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

/// A fixed-capacity ring buffer with O(1) push
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    buf: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create a ring buffer with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Push an item, evicting the oldest at capacity
    pub fn push(&mut self, item: T) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(item);
    }

    /// Number of stored items
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Iterate oldest to newest
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.buf.iter()
    }

    /// Most recently pushed item
    pub fn last(&self) -> Option<&T> {
        self.buf.back()
    }
}

impl RingBuffer<f64> {
    /// Arithmetic mean of the stored values
    pub fn mean(&self) -> f64 {
        if self.buf.is_empty() {
            return 0.0;
        }
        self.buf.iter().sum::<f64>() / self.buf.len() as f64
    }
}

/// One recorded observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    /// Arrival timestamp
    pub timestamp: DateTime<Utc>,
    /// Metric name
    pub name: String,
    /// Observed value
    pub value: f64,
    /// Free-form tags
    pub tags: HashMap<String, String>,
}

/// Alert thresholds read by `check_alerts`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// CPU gauge ceiling in [0,1]
    pub cpu: f64,
    /// Memory gauge ceiling in [0,1]
    pub memory: f64,
    /// Milliseconds without a completed task before a stall fires
    pub stall_timeout_ms: u64,
    /// Completions per minute below which throughput alerts; 0 disables
    pub min_throughput_per_min: f64,
    /// Failures per minute above which the error-rate alert fires
    pub error_rate_threshold: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu: 0.9,
            memory: 0.9,
            stall_timeout_ms: 300_000,
            min_throughput_per_min: 0.0,
            error_rate_threshold: 10.0,
        }
    }
}

/// A fired alert
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    /// Alert name
    pub name: String,
    /// Human-readable message
    pub message: String,
    /// Observed value
    pub value: f64,
    /// Threshold that was crossed
    pub threshold: f64,
    /// Fire timestamp
    pub timestamp: DateTime<Utc>,
}

/// Derived metrics computed on query
#[derive(Debug, Clone, Serialize, Default)]
pub struct DerivedMetrics {
    /// Tasks completed in the last minute
    pub throughput_per_min: f64,
    /// Failures in the last minute
    pub error_rate_per_min: f64,
    /// Mean reported worker utilization, as a percentage
    pub utilization_pct: f64,
    /// Mean task duration in milliseconds
    pub avg_task_duration_ms: f64,
}

#[derive(Debug)]
struct MetricsInner {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    histograms: HashMap<String, RingBuffer<f64>>,
    samples: RingBuffer<MetricSample>,
}

/// Collector shared by every component
pub struct MetricsCollector {
    retention: usize,
    inner: RwLock<MetricsInner>,
}

impl MetricsCollector {
    /// Create a collector retaining up to `retention` samples per series
    pub fn new(retention: usize) -> Self {
        Self {
            retention,
            inner: RwLock::new(MetricsInner {
                counters: HashMap::new(),
                gauges: HashMap::new(),
                histograms: HashMap::new(),
                samples: RingBuffer::new(retention),
            }),
        }
    }

    /// Increment a counter by one
    pub fn incr(&self, name: &str) {
        self.incr_by(name, 1);
    }

    /// Increment a counter
    pub fn incr_by(&self, name: &str, delta: u64) {
        let mut inner = self.inner.write().unwrap();
        *inner.counters.entry(name.to_string()).or_insert(0) += delta;
    }

    /// Set a gauge
    pub fn set_gauge(&self, name: &str, value: f64) {
        let mut inner = self.inner.write().unwrap();
        inner.gauges.insert(name.to_string(), value);
    }

    /// Record a histogram observation, with an accompanying raw sample
    pub fn observe(&self, name: &str, value: f64) {
        self.observe_tagged(name, value, HashMap::new());
    }

    /// Record a tagged observation
    pub fn observe_tagged(&self, name: &str, value: f64, tags: HashMap<String, String>) {
        let mut inner = self.inner.write().unwrap();
        let retention = self.retention;
        inner
            .histograms
            .entry(name.to_string())
            .or_insert_with(|| RingBuffer::new(retention))
            .push(value);
        inner.samples.push(MetricSample {
            timestamp: Utc::now(),
            name: name.to_string(),
            value,
            tags,
        });
    }

    /// Counter value, zero when never incremented
    pub fn counter(&self, name: &str) -> u64 {
        self.inner
            .read()
            .unwrap()
            .counters
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Gauge value, if set
    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.inner.read().unwrap().gauges.get(name).copied()
    }

    /// Histogram mean, zero when empty
    pub fn mean(&self, name: &str) -> f64 {
        self.inner
            .read()
            .unwrap()
            .histograms
            .get(name)
            .map(|h| h.mean())
            .unwrap_or(0.0)
    }

    /// Fold a coordination event into the counters, tagging errors by kind
    pub fn record_event(&self, event: &CoordinationEvent) {
        self.incr(&format!("events.{}", event.name()));
        if let CoordinationEvent::TaskFailed { error_kind, .. } = event {
            self.incr(&format!("errors.{error_kind}"));
            self.observe("task.failed", 1.0);
        }
        if let CoordinationEvent::TaskCompleted { duration_ms, .. } = event {
            self.observe("task.duration_ms", *duration_ms as f64);
            self.observe("task.completed", 1.0);
        }
    }

    fn rate_per_min(samples: &RingBuffer<MetricSample>, name: &str) -> f64 {
        let cutoff = Utc::now() - ChronoDuration::seconds(60);
        samples
            .iter()
            .filter(|s| s.name == name && s.timestamp >= cutoff)
            .count() as f64
    }

    /// Compute the derived metrics the balancer and alert channel consume
    pub fn derived(&self) -> DerivedMetrics {
        let inner = self.inner.read().unwrap();
        DerivedMetrics {
            throughput_per_min: Self::rate_per_min(&inner.samples, "task.completed"),
            error_rate_per_min: Self::rate_per_min(&inner.samples, "task.failed"),
            utilization_pct: inner
                .histograms
                .get("worker.utilization")
                .map(|h| h.mean() * 100.0)
                .unwrap_or(0.0),
            avg_task_duration_ms: inner
                .histograms
                .get("task.duration_ms")
                .map(|h| h.mean())
                .unwrap_or(0.0),
        }
    }

    /// Evaluate alert thresholds against the current state
    pub fn check_alerts(&self, thresholds: &AlertThresholds) -> Vec<Alert> {
        let mut alerts = Vec::new();
        let now = Utc::now();
        let derived = self.derived();

        if let Some(cpu) = self.gauge("system.cpu") {
            if cpu > thresholds.cpu {
                alerts.push(Alert {
                    name: "high_cpu".to_string(),
                    message: format!("system cpu at {:.0}%", cpu * 100.0),
                    value: cpu,
                    threshold: thresholds.cpu,
                    timestamp: now,
                });
            }
        }
        if let Some(memory) = self.gauge("system.memory") {
            if memory > thresholds.memory {
                alerts.push(Alert {
                    name: "high_memory".to_string(),
                    message: format!("system memory at {:.0}%", memory * 100.0),
                    value: memory,
                    threshold: thresholds.memory,
                    timestamp: now,
                });
            }
        }

        let inner = self.inner.read().unwrap();
        let last_completion = inner
            .samples
            .iter()
            .filter(|s| s.name == "task.completed")
            .last()
            .map(|s| s.timestamp);
        drop(inner);

        if let Some(last) = last_completion {
            let stalled_ms = (now - last).num_milliseconds();
            if stalled_ms > thresholds.stall_timeout_ms as i64 {
                alerts.push(Alert {
                    name: "stall".to_string(),
                    message: format!("no task completed for {stalled_ms} ms"),
                    value: stalled_ms as f64,
                    threshold: thresholds.stall_timeout_ms as f64,
                    timestamp: now,
                });
            }
        }

        if thresholds.min_throughput_per_min > 0.0
            && derived.throughput_per_min < thresholds.min_throughput_per_min
        {
            alerts.push(Alert {
                name: "low_throughput".to_string(),
                message: format!(
                    "{:.1} completions/min, expected at least {:.1}",
                    derived.throughput_per_min, thresholds.min_throughput_per_min
                ),
                value: derived.throughput_per_min,
                threshold: thresholds.min_throughput_per_min,
                timestamp: now,
            });
        }

        if derived.error_rate_per_min > thresholds.error_rate_threshold {
            alerts.push(Alert {
                name: "high_error_rate".to_string(),
                message: format!("{:.1} failures/min", derived.error_rate_per_min),
                value: derived.error_rate_per_min,
                threshold: thresholds.error_rate_threshold,
                timestamp: now,
            });
        }

        alerts
    }

    /// Serializable dump of counters and gauges
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.read().unwrap();
        MetricsSnapshot {
            counters: inner.counters.clone(),
            gauges: inner.gauges.clone(),
            histogram_means: inner
                .histograms
                .iter()
                .map(|(name, h)| (name.clone(), h.mean()))
                .collect(),
            sample_count: inner.samples.len(),
        }
    }
}

/// Point-in-time dump of the collector
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// All counters
    pub counters: HashMap<String, u64>,
    /// All gauges
    pub gauges: HashMap<String, f64>,
    /// Histogram means
    pub histogram_means: HashMap<String, f64>,
    /// Raw samples currently retained
    pub sample_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_eviction() {
        let mut ring = RingBuffer::new(3);
        for i in 0..5 {
            ring.push(i as f64);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2.0, 3.0, 4.0]);
        assert_eq!(ring.mean(), 3.0);
    }

    #[test]
    fn test_counters_and_gauges() {
        let metrics = MetricsCollector::new(100);
        metrics.incr("events.task_created");
        metrics.incr_by("events.task_created", 2);
        metrics.set_gauge("system.cpu", 0.5);

        assert_eq!(metrics.counter("events.task_created"), 3);
        assert_eq!(metrics.gauge("system.cpu"), Some(0.5));
        assert_eq!(metrics.counter("missing"), 0);
    }

    #[test]
    fn test_histogram_bounded() {
        let metrics = MetricsCollector::new(10);
        for i in 0..20 {
            metrics.observe("task.duration_ms", i as f64);
        }
        // Only the last 10 are retained: 10..=19, mean 14.5
        assert_eq!(metrics.mean("task.duration_ms"), 14.5);
    }

    #[test]
    fn test_event_recording_and_derived() {
        let metrics = MetricsCollector::new(100);
        metrics.record_event(&CoordinationEvent::TaskCompleted {
            task_id: "t1".to_string(),
            worker_id: "w1".to_string(),
            duration_ms: 200,
        });
        metrics.record_event(&CoordinationEvent::TaskFailed {
            task_id: "t2".to_string(),
            error_kind: "timeout".to_string(),
            will_retry: false,
        });

        assert_eq!(metrics.counter("events.task_completed"), 1);
        assert_eq!(metrics.counter("errors.timeout"), 1);

        let derived = metrics.derived();
        assert_eq!(derived.throughput_per_min, 1.0);
        assert_eq!(derived.error_rate_per_min, 1.0);
        assert_eq!(derived.avg_task_duration_ms, 200.0);
    }

    #[test]
    fn test_alerts() {
        let metrics = MetricsCollector::new(100);
        metrics.set_gauge("system.cpu", 0.95);

        let thresholds = AlertThresholds::default();
        let alerts = metrics.check_alerts(&thresholds);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].name, "high_cpu");
    }
}
