//! Prometheus metrics for the array engine.
//!
//! Tracks how much data crosses rank boundaries and how long collectives take.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Process-wide metrics registry
static REGISTRY: OnceLock<MetricsRegistry> = OnceLock::new();

pub struct MetricsRegistry {
    pub registry: Registry,

    // Point-to-point traffic, in elements
    pub remote_get_elements: Counter,
    pub remote_put_elements: Counter,
    pub accumulate_elements: Counter,

    // Collectives
    pub collective_ops: CounterVec,
    pub dot_duration: Histogram,

    // Registered memory, in elements, summed over live global arrays on this process
    pub global_elements: Gauge,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let remote_get_elements = Counter::with_opts(
            Opts::new("darray_remote_get_elements_total", "Elements read from other ranks")
        ).unwrap();
        registry.register(Box::new(remote_get_elements.clone())).unwrap();

        let remote_put_elements = Counter::with_opts(
            Opts::new("darray_remote_put_elements_total", "Elements written to other ranks")
        ).unwrap();
        registry.register(Box::new(remote_put_elements.clone())).unwrap();

        let accumulate_elements = Counter::with_opts(
            Opts::new("darray_accumulate_elements_total", "Elements accumulated into global arrays")
        ).unwrap();
        registry.register(Box::new(accumulate_elements.clone())).unwrap();

        let collective_ops = CounterVec::new(
            Opts::new("darray_collective_ops_total", "Collective operations by kind"),
            &["op"],
        ).unwrap();
        registry.register(Box::new(collective_ops.clone())).unwrap();

        let dot_duration = Histogram::with_opts(
            HistogramOpts::new("darray_dot_duration_seconds", "Wall time of collective dot")
                .buckets(vec![0.0001, 0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0])
        ).unwrap();
        registry.register(Box::new(dot_duration.clone())).unwrap();

        let global_elements = Gauge::with_opts(
            Opts::new("darray_global_elements", "Elements registered in live global arrays")
        ).unwrap();
        registry.register(Box::new(global_elements.clone())).unwrap();

        Self {
            registry,
            remote_get_elements,
            remote_put_elements,
            accumulate_elements,
            collective_ops,
            dot_duration,
            global_elements,
        }
    }

    /// Gather all metrics as Prometheus text format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Get the global metrics registry.
pub fn get_metrics() -> &'static MetricsRegistry {
    REGISTRY.get_or_init(MetricsRegistry::new)
}

pub fn record_remote_get(elements: usize) {
    get_metrics().remote_get_elements.inc_by(elements as f64);
}

pub fn record_remote_put(elements: usize) {
    get_metrics().remote_put_elements.inc_by(elements as f64);
}

pub fn record_accumulate(elements: usize) {
    get_metrics().accumulate_elements.inc_by(elements as f64);
}

pub fn record_collective(op: &str) {
    get_metrics().collective_ops.with_label_values(&[op]).inc();
}

pub fn record_dot_duration(duration_secs: f64) {
    get_metrics().dot_duration.observe(duration_secs);
}

pub fn record_global_alloc(elements: usize) {
    get_metrics().global_elements.add(elements as f64);
}

pub fn record_global_free(elements: usize) {
    get_metrics().global_elements.sub(elements as f64);
}
