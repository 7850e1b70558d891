//! Gateway metrics in Prometheus text format
//!
//! Covers ownership churn, dispatch outcomes and latency, command-log
//! processing and live connection counts.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for dispatch latency (in milliseconds)
const LATENCY_BUCKETS: [f64; 12] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 30000.0, 600000.0,
];

/// Cumulative latency histogram
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: &'static [f64],
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            buckets: (0..=LATENCY_BUCKETS.len()).map(|_| AtomicU64::new(0)).collect(),
            boundaries: &LATENCY_BUCKETS,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, millis: f64) {
        let idx = self
            .boundaries
            .iter()
            .position(|&b| millis <= b)
            .unwrap_or(self.boundaries.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((millis * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative (le, count) pairs, ending with +Inf
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut total = 0u64;
        let mut out = Vec::with_capacity(self.buckets.len());
        for (i, bucket) in self.buckets.iter().enumerate() {
            total += bucket.load(Ordering::Relaxed);
            let le = self.boundaries.get(i).copied().unwrap_or(f64::INFINITY);
            out.push((le, total));
        }
        out
    }

    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0
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
        Self::default()
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
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturating decrement
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Process-wide metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    // Ownership
    pub ownership_acquired: Counter,
    pub ownership_conflicts: Counter,
    pub ownership_lost: Counter,
    pub ownership_released: Counter,

    // Dispatch
    pub dispatch_local: Counter,
    pub dispatch_remote: Counter,
    pub dispatch_timeouts: Counter,
    pub dispatch_errors: Counter,
    pub dispatch_latency: Histogram,

    // Command log
    pub commands_processed: Counter,
    pub commands_deduplicated: Counter,
    pub commands_expired: Counter,
    pub commands_malformed: Counter,
    pub commands_dead_lettered: Counter,
    pub commands_claimed: Counter,
    pub replies_published: Counter,

    // Connections
    pub active_connections: Gauge,
    pub owned_connectors: Gauge,
    pub pooled_resources: Gauge,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            ownership_acquired: Counter::new(),
            ownership_conflicts: Counter::new(),
            ownership_lost: Counter::new(),
            ownership_released: Counter::new(),
            dispatch_local: Counter::new(),
            dispatch_remote: Counter::new(),
            dispatch_timeouts: Counter::new(),
            dispatch_errors: Counter::new(),
            dispatch_latency: Histogram::new(),
            commands_processed: Counter::new(),
            commands_deduplicated: Counter::new(),
            commands_expired: Counter::new(),
            commands_malformed: Counter::new(),
            commands_dead_lettered: Counter::new(),
            commands_claimed: Counter::new(),
            replies_published: Counter::new(),
            active_connections: Gauge::new(),
            owned_connectors: Gauge::new(),
            pooled_resources: Gauge::new(),
            start_time: Instant::now(),
        }
    }

    /// Record the outcome of a dispatch
    pub fn record_dispatch(&self, duration: Duration, outcome: &crate::Result<serde_json::Value>) {
        self.dispatch_latency
            .observe(duration.as_secs_f64() * 1000.0);
        match outcome {
            Ok(_) => {}
            Err(crate::Error::Timeout(_)) => self.dispatch_timeouts.inc(),
            Err(_) => self.dispatch_errors.inc(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let series: [(&str, &str, &str, u64); 18] = [
            ("ownership_acquired_total", "Successful ownership acquisitions", "counter", self.ownership_acquired.get()),
            ("ownership_conflicts_total", "Acquisitions refused because another instance owns the connector", "counter", self.ownership_conflicts.get()),
            ("ownership_lost_total", "Ownerships lost on refresh", "counter", self.ownership_lost.get()),
            ("ownership_released_total", "Explicit ownership releases", "counter", self.ownership_released.get()),
            ("dispatch_local_total", "Commands dispatched over a local socket", "counter", self.dispatch_local.get()),
            ("dispatch_remote_total", "Commands routed through the command log", "counter", self.dispatch_remote.get()),
            ("dispatch_timeouts_total", "Dispatches that timed out", "counter", self.dispatch_timeouts.get()),
            ("dispatch_errors_total", "Dispatches that failed", "counter", self.dispatch_errors.get()),
            ("commands_processed_total", "Command log entries handled", "counter", self.commands_processed.get()),
            ("commands_deduplicated_total", "Replayed command log entries skipped", "counter", self.commands_deduplicated.get()),
            ("commands_expired_total", "Command log entries rejected past their deadline", "counter", self.commands_expired.get()),
            ("commands_malformed_total", "Unparseable command log entries dropped", "counter", self.commands_malformed.get()),
            ("commands_dead_lettered_total", "Entries dropped after repeated handler failures", "counter", self.commands_dead_lettered.get()),
            ("commands_claimed_total", "Entries claimed from dead consumers", "counter", self.commands_claimed.get()),
            ("replies_published_total", "Replies appended to reply logs", "counter", self.replies_published.get()),
            ("active_connections", "Open connector sockets", "gauge", self.active_connections.get()),
            ("owned_connectors", "Connectors owned by this instance", "gauge", self.owned_connectors.get()),
            ("pooled_resources", "Resources held by pool managers", "gauge", self.pooled_resources.get()),
        ];

        for (name, help, kind, value) in series {
            let _ = writeln!(out, "# HELP gateway_{} {}", name, help);
            let _ = writeln!(out, "# TYPE gateway_{} {}", name, kind);
            let _ = writeln!(out, "gateway_{} {}", name, value);
        }

        let _ = writeln!(out, "# HELP gateway_uptime_seconds Process uptime in seconds");
        let _ = writeln!(out, "# TYPE gateway_uptime_seconds gauge");
        let _ = writeln!(out, "gateway_uptime_seconds {}", self.uptime_seconds());

        let _ = writeln!(out, "# HELP gateway_dispatch_duration_ms Dispatch duration in milliseconds");
        let _ = writeln!(out, "# TYPE gateway_dispatch_duration_ms histogram");
        for (le, count) in self.dispatch_latency.cumulative() {
            if le.is_infinite() {
                let _ = writeln!(out, "gateway_dispatch_duration_ms_bucket{{le=\"+Inf\"}} {}", count);
            } else {
                let _ = writeln!(out, "gateway_dispatch_duration_ms_bucket{{le=\"{}\"}} {}", le, count);
            }
        }
        let _ = writeln!(out, "gateway_dispatch_duration_ms_sum {}", self.dispatch_latency.sum());
        let _ = writeln!(out, "gateway_dispatch_duration_ms_count {}", self.dispatch_latency.count());

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
    fn test_histogram_cumulative() {
        let hist = Histogram::new();
        hist.observe(3.0);
        hist.observe(40.0);
        hist.observe(1_000_000.0);

        assert_eq!(hist.count(), 3);
        let buckets = hist.cumulative();
        assert_eq!(buckets.first(), Some(&(1.0, 0)));
        assert_eq!(buckets.last(), Some(&(f64::INFINITY, 3)));
    }

    #[test]
    fn test_gauge_saturates() {
        let gauge = Gauge::new();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
    }

    #[test]
    fn test_record_dispatch() {
        let registry = MetricsRegistry::new();
        registry.record_dispatch(Duration::from_millis(5), &Ok(serde_json::json!({})));
        registry.record_dispatch(
            Duration::from_secs(30),
            &Err(crate::Error::Timeout("c".into())),
        );
        registry.record_dispatch(
            Duration::from_millis(1),
            &Err(crate::Error::NotConnected("c".into())),
        );

        assert_eq!(registry.dispatch_latency.count(), 3);
        assert_eq!(registry.dispatch_timeouts.get(), 1);
        assert_eq!(registry.dispatch_errors.get(), 1);

        let text = registry.to_prometheus();
        assert!(text.contains("gateway_dispatch_timeouts_total 1"));
        assert!(text.contains("# TYPE gateway_active_connections gauge"));
    }
}
