//! Observability: event counters plus latency histograms (p50/p95/p99).
//! Failures never surface to callers; this registry and the tracing logs
//! are where they show up.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

/// Measures from creation until `finish` or drop, whichever comes first.
pub struct TimingSpan {
    name: &'static str,
    start: Instant,
    registry: Arc<MetricsRegistry>,
    recorded: bool,
}

impl TimingSpan {
    /// Record now and return the elapsed microseconds.
    pub fn finish(mut self) -> f64 {
        self.recorded = true;
        let elapsed_us = self.start.elapsed().as_micros() as f64;
        self.registry.record(self.name, elapsed_us);
        elapsed_us
    }
}

impl Drop for TimingSpan {
    fn drop(&mut self) {
        if !self.recorded {
            self.registry
                .record(self.name, self.start.elapsed().as_micros() as f64);
        }
    }
}

/// Most recent samples of one histogram.
struct LatencyWindow {
    samples: VecDeque<f64>,
    capacity: usize,
    total: u64,
}

impl LatencyWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            total: 0,
        }
    }

    fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
        self.total += 1;
    }

    /// Nearest-rank percentile over the window.
    fn percentile(&self, p: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        sorted[rank.clamp(1, sorted.len()) - 1]
    }

    fn max(&self) -> f64 {
        self.samples.iter().copied().fold(0.0, f64::max)
    }
}

pub struct MetricsRegistry {
    counters: Mutex<HashMap<&'static str, u64>>,
    histograms: Mutex<HashMap<&'static str, LatencyWindow>>,
    window: usize,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_window(1024)
    }

    /// Keep the last `window` samples per histogram.
    pub fn with_window(window: usize) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            histograms: Mutex::new(HashMap::new()),
            window: window.max(1),
        }
    }

    pub fn incr(&self, name: &'static str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &'static str, n: u64) {
        if n == 0 {
            return;
        }
        *self.counters.lock().entry(name).or_insert(0) += n;
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    pub fn counters(&self) -> HashMap<String, u64> {
        self.counters
            .lock()
            .iter()
            .map(|(&k, &v)| (k.to_string(), v))
            .collect()
    }

    /// Record a latency sample in microseconds.
    pub fn record(&self, name: &'static str, value_us: f64) {
        self.histograms
            .lock()
            .entry(name)
            .or_insert_with(|| LatencyWindow::new(self.window))
            .push(value_us);
        tracing::trace!(metric = name, value_us, "latency sample");
    }

    pub fn span(self: &Arc<Self>, name: &'static str) -> TimingSpan {
        TimingSpan {
            name,
            start: Instant::now(),
            registry: Arc::clone(self),
            recorded: false,
        }
    }

    /// Percentile (0-100) of a histogram in microseconds; 0 when empty.
    pub fn percentile(&self, name: &str, p: f64) -> f64 {
        self.histograms
            .lock()
            .get(name)
            .map_or(0.0, |w| w.percentile(p))
    }

    pub fn summary(&self) -> HashMap<String, MetricSummary> {
        self.histograms
            .lock()
            .iter()
            .map(|(&name, w)| {
                (
                    name.to_string(),
                    MetricSummary {
                        p50_us: w.percentile(50.0),
                        p95_us: w.percentile(95.0),
                        p99_us: w.percentile(99.0),
                        max_us: w.max(),
                        count: w.total,
                    },
                )
            })
            .collect()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    /// Largest sample still in the window.
    pub max_us: f64,
    /// Samples ever recorded, including those rotated out.
    pub count: u64,
}

pub mod metric_names {
    // Histograms
    pub const PAGE_PASS: &str = "t_page_pass";
    pub const PROVIDER_CALL: &str = "t_provider_call";
    // Counters
    pub const PASSES: &str = "passes";
    pub const PASSES_JOINED: &str = "passes_joined";
    pub const PASSES_STALE: &str = "passes_stale";
    pub const PAGES_INVALIDATED: &str = "pages_invalidated";
    pub const EPHEMERAL_HITS: &str = "ephemeral_hits";
    pub const STORE_HITS: &str = "store_hits";
    pub const STORE_ERRORS: &str = "store_errors";
    pub const PROVIDER_CALLS: &str = "provider_calls";
    pub const PROVIDER_OK: &str = "provider_ok";
    pub const PROVIDER_FAILED: &str = "provider_failed";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const CIRCUIT_SKIPPED: &str = "circuit_skipped";
    pub const MEMO_HITS: &str = "memo_hits";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = MetricsRegistry::new();
        m.incr(metric_names::PROVIDER_CALLS);
        m.add(metric_names::PROVIDER_CALLS, 2);
        m.add(metric_names::STORE_HITS, 0);
        assert_eq!(m.counter(metric_names::PROVIDER_CALLS), 3);
        assert_eq!(m.counter(metric_names::STORE_HITS), 0);
        assert!(!m.counters().contains_key(metric_names::STORE_HITS));
    }

    #[test]
    fn nearest_rank_percentiles() {
        let m = MetricsRegistry::new();
        for v in 1..=100 {
            m.record(metric_names::PROVIDER_CALL, v as f64);
        }
        assert_eq!(m.percentile(metric_names::PROVIDER_CALL, 50.0), 50.0);
        assert_eq!(m.percentile(metric_names::PROVIDER_CALL, 95.0), 95.0);
        assert_eq!(m.percentile(metric_names::PROVIDER_CALL, 0.0), 1.0);
        assert_eq!(m.percentile("unknown", 50.0), 0.0);
        let summary = &m.summary()[metric_names::PROVIDER_CALL];
        assert_eq!(summary.count, 100);
        assert_eq!(summary.max_us, 100.0);
    }

    #[test]
    fn window_keeps_latest_samples() {
        let m = MetricsRegistry::with_window(3);
        for v in [100.0, 1.0, 2.0, 3.0] {
            m.record(metric_names::PROVIDER_CALL, v);
        }
        let summary = &m.summary()[metric_names::PROVIDER_CALL];
        assert_eq!(summary.max_us, 3.0);
        assert_eq!(summary.count, 4);
    }

    #[test]
    fn span_records_once() {
        let m = Arc::new(MetricsRegistry::new());
        m.span(metric_names::PAGE_PASS).finish();
        drop(m.span(metric_names::PAGE_PASS));
        assert_eq!(m.summary()[metric_names::PAGE_PASS].count, 2);
    }
}
