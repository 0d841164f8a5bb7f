//! Timing histograms for the real-time paths: analysis, frame pacing,
//! capture reads and metadata round trips. Reports count, mean, max and p50/p95/p99 per metric.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Times a section of code. Records when finished or dropped, whichever
/// comes first, so early returns are still measured.
pub struct TimingSpan {
    name: &'static str,
    start: Instant,
    registry: Arc<MetricsRegistry>,
    recorded: bool,
}

impl TimingSpan {
    pub fn new(name: &'static str, registry: Arc<MetricsRegistry>) -> Self {
        Self {
            name,
            start: Instant::now(),
            registry,
            recorded: false,
        }
    }

    /// Record now and return the elapsed microseconds.
    pub fn finish(mut self) -> f64 {
        self.record()
    }

    fn record(&mut self) -> f64 {
        let elapsed_us = self.start.elapsed().as_secs_f64() * 1e6;
        if !self.recorded {
            self.recorded = true;
            self.registry.record(self.name, elapsed_us);
        }
        elapsed_us
    }
}

impl Drop for TimingSpan {
    fn drop(&mut self) {
        self.record();
    }
}

/// Latest `capacity` samples of one metric.
struct Window {
    samples: Vec<f64>,
    next: usize,
    filled: bool,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            next: 0,
            filled: false,
        }
    }

    fn push(&mut self, value: f64, capacity: usize) {
        if !self.filled {
            self.samples.push(value);
            self.filled = self.samples.len() == capacity;
        } else {
            self.samples[self.next] = value;
        }
        self.next = (self.next + 1) % capacity;
    }

    fn sorted(&self) -> Vec<f64> {
        let mut sorted = self.samples.clone();
        sorted.sort_by(f64::total_cmp);
        sorted
    }
}

/// Nearest-rank percentile over an ascending slice; 0 when empty.
fn rank(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Named timing windows. Shared by every thread through an `Arc`.
pub struct MetricsRegistry {
    windows: Mutex<HashMap<&'static str, Window>>,
    capacity: usize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Record one sample, in microseconds.
    pub fn record(&self, name: &'static str, value_us: f64) {
        let capacity = self.capacity;
        self.windows
            .lock()
            .entry(name)
            .or_insert_with(|| Window::new(capacity))
            .push(value_us, capacity);
        tracing::trace!(metric = name, value_us, "metric_recorded");
    }

    pub fn span(self: &Arc<Self>, name: &'static str) -> TimingSpan {
        TimingSpan::new(name, Arc::clone(self))
    }

    /// Percentile (0-100) of the named metric in microseconds; 0 if unseen.
    pub fn percentile(&self, name: &str, p: f64) -> f64 {
        self.windows
            .lock()
            .get(name)
            .map(|w| rank(&w.sorted(), p))
            .unwrap_or(0.0)
    }

    pub fn summary(&self) -> HashMap<String, MetricSummary> {
        self.windows
            .lock()
            .iter()
            .map(|(&name, window)| {
                let sorted = window.sorted();
                let mean = sorted.iter().sum::<f64>() / sorted.len().max(1) as f64;
                let summary = MetricSummary {
                    count: sorted.len(),
                    mean_us: mean,
                    p50_us: rank(&sorted, 50.0),
                    p95_us: rank(&sorted, 95.0),
                    p99_us: rank(&sorted, 99.0),
                    max_us: sorted.last().copied().unwrap_or(0.0),
                };
                (name.to_string(), summary)
            })
            .collect()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricSummary {
    pub count: usize,
    pub mean_us: f64,
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub max_us: f64,
}

/// Well-known metric names.
pub mod metric_names {
    pub const SPECTRUM_ANALYSIS: &str = "t_spectrum_analysis";
    pub const STEREO_ANALYSIS: &str = "t_stereo_analysis";
    pub const FRAME: &str = "t_frame";
    pub const CAPTURE_READ: &str = "t_capture_read";
    pub const METADATA_CONNECT: &str = "t_metadata_connect";
    pub const METADATA_FETCH: &str = "t_metadata_fetch";
}
