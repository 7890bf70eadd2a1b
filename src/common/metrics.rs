//! Metrics collection
//!
//! Two families are exposed on `/metrics` in the Prometheus text format:
//! - The counter mirror: one monotonic counter per `(app, type)`, rebuilt from
//!   the store at startup and bumped after every committed increment
//! - Request metrics for the HTTP layer (counts, errors, latency histograms)

use crate::common::config::MetricsConfig;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// Content type of the text exposition format
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Values behind these locks are maps of atomics, a poisoned guard is still consistent
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Escape a label value for the text exposition format
pub fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with default latency buckets
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    /// Create a histogram with custom bucket boundaries
    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in the histogram
    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // Stored as thousandths to keep sub-millisecond precision in an integer
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative bucket counts, ending with `+Inf`
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

/// Monotonic counter
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

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// One exported sample of the mirror
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorSample {
    pub app: String,
    pub counter_type: String,
    pub value: u64,
}

/// In-memory copy of the durable counter totals, keyed by `(app, type)`.
///
/// Only grows: there is no way to remove a series or lower its value. Writers
/// never need an outer lock; the inner map lock is held just long enough to
/// find or create the per-series [`Counter`].
#[derive(Debug)]
pub struct CounterMirror {
    name: String,
    help: String,
    series: Mutex<BTreeMap<(String, String), Arc<Counter>>>,
}

impl CounterMirror {
    pub fn new(config: &MetricsConfig) -> Self {
        Self {
            name: config.full_name(),
            help: "total count of calls".to_string(),
            series: Mutex::new(BTreeMap::new()),
        }
    }

    /// Metric family name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get or create the counter for a series
    pub fn counter(&self, app: &str, counter_type: &str) -> Arc<Counter> {
        lock(&self.series)
            .entry((app.to_string(), counter_type.to_string()))
            .or_insert_with(|| Arc::new(Counter::new()))
            .clone()
    }

    pub fn add(&self, app: &str, counter_type: &str, delta: u64) {
        self.counter(app, counter_type).add(delta);
    }

    pub fn inc(&self, app: &str, counter_type: &str) {
        self.counter(app, counter_type).inc();
    }

    /// Current value, 0 for a series never touched
    pub fn get(&self, app: &str, counter_type: &str) -> u64 {
        lock(&self.series)
            .get(&(app.to_string(), counter_type.to_string()))
            .map(|c| c.get())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        lock(&self.series).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of every series, ordered by `(app, type)`
    pub fn snapshot(&self) -> Vec<MirrorSample> {
        lock(&self.series)
            .iter()
            .map(|((app, counter_type), counter)| MirrorSample {
                app: app.clone(),
                counter_type: counter_type.clone(),
                value: counter.get(),
            })
            .collect()
    }

    /// Append the family in the text exposition format
    pub fn render_prometheus(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} counter", self.name);
        for sample in self.snapshot() {
            let _ = writeln!(
                out,
                "{}{{type=\"{}\",app=\"{}\"}} {}",
                self.name,
                escape_label_value(&sample.counter_type),
                escape_label_value(&sample.app),
                sample.value
            );
        }
    }
}

/// Endpoint metrics
#[derive(Debug, Default)]
pub struct EndpointMetrics {
    pub requests_total: Counter,
    pub requests_success: Counter,
    pub requests_error: Counter,
    pub latency: Histogram,
}

/// Request metrics for the HTTP layer
#[derive(Debug)]
pub struct MetricsRegistry {
    endpoints: Mutex<HashMap<String, Arc<EndpointMetrics>>>,

    pub total_requests: Counter,
    pub total_errors: Counter,
    pub panics: Counter,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            total_requests: Counter::new(),
            total_errors: Counter::new(),
            panics: Counter::new(),
            start_time: Instant::now(),
        }
    }

    /// Get or create metrics for an endpoint
    pub fn endpoint(&self, path: &str) -> Arc<EndpointMetrics> {
        lock(&self.endpoints)
            .entry(path.to_string())
            .or_default()
            .clone()
    }

    /// Record a finished request
    pub fn record_request(&self, path: &str, duration: Duration, success: bool) {
        let endpoint = self.endpoint(path);

        endpoint.requests_total.inc();
        endpoint.latency.observe(duration.as_secs_f64() * 1000.0);

        self.total_requests.inc();

        if success {
            endpoint.requests_success.inc();
        } else {
            endpoint.requests_error.inc();
            self.total_errors.inc();
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Append request metrics in the text exposition format
    pub fn render_prometheus(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP insight_requests_total Total number of requests");
        let _ = writeln!(out, "# TYPE insight_requests_total counter");
        let _ = writeln!(out, "insight_requests_total {}", self.total_requests.get());

        let _ = writeln!(out, "# HELP insight_errors_total Total number of failed requests");
        let _ = writeln!(out, "# TYPE insight_errors_total counter");
        let _ = writeln!(out, "insight_errors_total {}", self.total_errors.get());

        let _ = writeln!(out, "# HELP insight_handler_panics_total Recovered handler panics");
        let _ = writeln!(out, "# TYPE insight_handler_panics_total counter");
        let _ = writeln!(out, "insight_handler_panics_total {}", self.panics.get());

        let _ = writeln!(out, "# HELP insight_uptime_seconds Server uptime in seconds");
        let _ = writeln!(out, "# TYPE insight_uptime_seconds gauge");
        let _ = writeln!(out, "insight_uptime_seconds {}", self.uptime_seconds());

        let endpoints: Vec<(String, Arc<EndpointMetrics>)> = {
            let guard = lock(&self.endpoints);
            let mut entries: Vec<_> = guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries
        };

        let _ = writeln!(out, "# HELP insight_endpoint_requests_total Requests per endpoint");
        let _ = writeln!(out, "# TYPE insight_endpoint_requests_total counter");
        for (path, metrics) in &endpoints {
            let _ = writeln!(
                out,
                "insight_endpoint_requests_total{{path=\"{}\"}} {}",
                escape_label_value(path),
                metrics.requests_total.get()
            );
        }

        let _ = writeln!(out, "# HELP insight_endpoint_errors_total Errors per endpoint");
        let _ = writeln!(out, "# TYPE insight_endpoint_errors_total counter");
        for (path, metrics) in &endpoints {
            let _ = writeln!(
                out,
                "insight_endpoint_errors_total{{path=\"{}\"}} {}",
                escape_label_value(path),
                metrics.requests_error.get()
            );
        }

        let _ = writeln!(out, "# HELP insight_request_duration_ms Request duration in milliseconds");
        let _ = writeln!(out, "# TYPE insight_request_duration_ms histogram");
        for (path, metrics) in &endpoints {
            let path = escape_label_value(path);
            for (le, count) in metrics.latency.get_buckets() {
                let le = if le.is_infinite() {
                    "+Inf".to_string()
                } else {
                    le.to_string()
                };
                let _ = writeln!(
                    out,
                    "insight_request_duration_ms_bucket{{path=\"{}\",le=\"{}\"}} {}",
                    path, le, count
                );
            }
            let _ = writeln!(
                out,
                "insight_request_duration_ms_sum{{path=\"{}\"}} {}",
                path,
                metrics.latency.sum()
            );
            let _ = writeln!(
                out,
                "insight_request_duration_ms_count{{path=\"{}\"}} {}",
                path,
                metrics.latency.count()
            );
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
