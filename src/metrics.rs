//! Delivery observability: bounded windows of recent samples per metric,
//! summarised as p50/p95/p99 for chunk delivery latency, packed size and
//! queue depth.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

const WINDOW: usize = 1024;

/// Measures elapsed time from creation until `finish`.
pub struct TimingSpan {
    name: &'static str,
    start: Instant,
    registry: Arc<MetricsRegistry>,
}

impl TimingSpan {
    /// Record elapsed milliseconds and return them.
    pub fn finish(self) -> f64 {
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.registry.record(self.name, elapsed_ms);
        elapsed_ms
    }
}

/// The most recent `WINDOW` samples of one metric, plus a lifetime count.
#[derive(Default)]
struct Window {
    recent: VecDeque<f64>,
    total: u64,
}

impl Window {
    fn push(&mut self, value: f64) {
        if self.recent.len() == WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(value);
        self.total += 1;
    }

    fn summarize(&self) -> MetricSummary {
        let mut sorted: Vec<f64> = self.recent.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let at = |q: f64| match sorted.len() {
            0 => 0.0,
            n => sorted[((n - 1) as f64 * q).round() as usize],
        };
        MetricSummary {
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
            max: sorted.last().copied().unwrap_or(0.0),
            count: self.total,
        }
    }
}

#[derive(Default)]
pub struct MetricsRegistry {
    windows: Mutex<HashMap<&'static str, Window>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, name: &'static str, value: f64) {
        self.windows.lock().entry(name).or_default().push(value);
        tracing::trace!(metric = name, value, "metric_recorded");
    }

    pub fn span(self: &Arc<Self>, name: &'static str) -> TimingSpan {
        TimingSpan {
            name,
            start: Instant::now(),
            registry: Arc::clone(self),
        }
    }

    /// Total samples ever recorded under `name`.
    pub fn count(&self, name: &str) -> u64 {
        self.windows.lock().get(name).map_or(0, |w| w.total)
    }

    /// Summary of one metric, `None` if nothing was recorded.
    pub fn summary(&self, name: &str) -> Option<MetricSummary> {
        self.windows.lock().get(name).map(Window::summarize)
    }

    /// Every recorded metric, keyed by name.
    pub fn snapshot(&self) -> HashMap<&'static str, MetricSummary> {
        self.windows
            .lock()
            .iter()
            .map(|(&name, w)| (name, w.summarize()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSummary {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
    pub count: u64,
}

pub mod metric_names {
    /// Milliseconds per successful chunk submission.
    pub const DELIVERY_MS: &str = "delivery_ms";
    pub const DELIVERY_FAILED: &str = "delivery_failed";
    pub const PACKED_BYTES: &str = "packed_bytes";
    /// Queue depth observed at each scheduler pass.
    pub const QUEUE_DEPTH: &str = "queue_depth";
    pub const DRAIN_MS: &str = "drain_ms";
}
