//! Reconcile metrics
//!
//! Prometheus-compatible counters, gauges and latency histograms for the
//! controller loop, labelled by component.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for reconcile latency (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // stored as microseconds
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative bucket counts, ending with +Inf
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// How a reconcile attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Requeue,
    Error,
}

/// Per-component reconcile metrics
#[derive(Debug, Default)]
pub struct ComponentMetrics {
    pub syncs_total: Counter,
    pub syncs_success: Counter,
    pub syncs_requeued: Counter,
    pub syncs_error: Counter,
    pub latency: Histogram,
}

/// Metrics registry shared by the controller and the HTTP endpoint
#[derive(Debug)]
pub struct MetricsRegistry {
    components: Mutex<HashMap<String, Arc<ComponentMetrics>>>,

    pub ticks_total: Counter,
    pub tick_errors: Counter,
    pub status_writes: Counter,
    pub queue_depth: Gauge,
    pub clusters: Gauge,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            components: Mutex::new(HashMap::new()),
            ticks_total: Counter::new(),
            tick_errors: Counter::new(),
            status_writes: Counter::new(),
            queue_depth: Gauge::new(),
            clusters: Gauge::new(),
            start_time: Instant::now(),
        }
    }

    /// Get or create metrics for a component
    pub fn component(&self, name: &str) -> Arc<ComponentMetrics> {
        let mut components = self.components.lock().unwrap_or_else(|e| e.into_inner());
        components
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn record_sync(&self, component: &str, duration: Duration, outcome: Outcome) {
        let metrics = self.component(component);
        metrics.syncs_total.inc();
        metrics.latency.observe(duration.as_secs_f64() * 1000.0);
        match outcome {
            Outcome::Success => metrics.syncs_success.inc(),
            Outcome::Requeue => metrics.syncs_requeued.inc(),
            Outcome::Error => metrics.syncs_error.inc(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();

        let scalars: [(&str, &str, &str, u64); 6] = [
            ("kvkeeper_ticks_total", "counter", "Cluster reconcile ticks", self.ticks_total.get()),
            ("kvkeeper_tick_errors_total", "counter", "Ticks that ended in an error", self.tick_errors.get()),
            ("kvkeeper_status_writes_total", "counter", "Cluster status writes", self.status_writes.get()),
            ("kvkeeper_queue_depth", "gauge", "Clusters waiting in the work queue", self.queue_depth.get()),
            ("kvkeeper_clusters", "gauge", "Clusters known to the controller", self.clusters.get()),
            ("kvkeeper_uptime_seconds", "gauge", "Controller uptime in seconds", self.uptime_seconds()),
        ];
        for (name, kind, help, value) in scalars {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} {}", name, kind);
            let _ = writeln!(out, "{} {}", name, value);
        }

        let components = self.components.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<&String> = components.keys().collect();
        names.sort();

        out.push_str("# HELP kvkeeper_component_syncs_total Component syncs by outcome\n");
        out.push_str("# TYPE kvkeeper_component_syncs_total counter\n");
        for name in &names {
            let m = &components[*name];
            for (outcome, value) in [
                ("success", m.syncs_success.get()),
                ("requeue", m.syncs_requeued.get()),
                ("error", m.syncs_error.get()),
            ] {
                let _ = writeln!(
                    out,
                    "kvkeeper_component_syncs_total{{component=\"{}\",outcome=\"{}\"}} {}",
                    name, outcome, value
                );
            }
        }

        out.push_str("# HELP kvkeeper_component_sync_duration_ms Component sync duration in milliseconds\n");
        out.push_str("# TYPE kvkeeper_component_sync_duration_ms histogram\n");
        for name in &names {
            let m = &components[*name];
            for (le, count) in m.latency.get_buckets() {
                let le = if le.is_infinite() {
                    "+Inf".to_string()
                } else {
                    le.to_string()
                };
                let _ = writeln!(
                    out,
                    "kvkeeper_component_sync_duration_ms_bucket{{component=\"{}\",le=\"{}\"}} {}",
                    name, le, count
                );
            }
            let _ = writeln!(
                out,
                "kvkeeper_component_sync_duration_ms_sum{{component=\"{}\"}} {}",
                name,
                m.latency.sum()
            );
            let _ = writeln!(
                out,
                "kvkeeper_component_sync_duration_ms_count{{component=\"{}\"}} {}",
                name,
                m.latency.count()
            );
        }

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::new();

        hist.observe(5.0);
        hist.observe(50.0);
        hist.observe(50_000.0);

        assert_eq!(hist.count(), 3);

        let buckets = hist.get_buckets();
        assert_eq!(buckets.first(), Some(&(5.0, 1)));
        assert_eq!(buckets.last().map(|b| b.1), Some(3));
    }

    #[test]
    fn test_record_sync() {
        let registry = MetricsRegistry::new();

        registry.record_sync("storage", Duration::from_millis(20), Outcome::Success);
        registry.record_sync("storage", Duration::from_millis(40), Outcome::Requeue);
        registry.record_sync("cdc", Duration::from_millis(40), Outcome::Error);

        let storage = registry.component("storage");
        assert_eq!(storage.syncs_total.get(), 2);
        assert_eq!(storage.syncs_requeued.get(), 1);

        let text = registry.to_prometheus();
        assert!(text.contains("kvkeeper_component_syncs_total{component=\"cdc\",outcome=\"error\"} 1"));
        assert!(text.contains("kvkeeper_component_sync_duration_ms_count{component=\"storage\"} 2"));
    }
}
