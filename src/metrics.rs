//! Write-only metrics sink plus a lightweight in-memory recorder.
//!
//! The recorder keeps a bounded sample window per histogram series so
//! diagnostics can report p50/p95 without an external metrics backend.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

const MAX_SAMPLES_PER_SERIES: usize = 256;

pub const BACKGROUND_TASKS: &str = "pult_background_tasks_total";
pub const JOB_FAILURES: &str = "pult_job_failures_total";
pub const PROCESSING_TIME: &str = "pult_processing_time_seconds";
pub const SCORE_UPDATES: &str = "pult_score_updates_total";
pub const CACHE_REQUESTS: &str = "pult_cache_requests_total";
pub const RATE_LIMIT: &str = "pult_rate_limit_total";
pub const PUSH: &str = "pult_push_total";
pub const BREAKER_TRANSITIONS: &str = "pult_breaker_transitions_total";

pub type Labels<'a> = &'a [(&'a str, &'a str)];

pub trait MetricsSink: Send + Sync {
    fn increment(&self, counter: &str, labels: Labels<'_>);
    fn observe(&self, histogram: &str, labels: Labels<'_>, value: f64);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _counter: &str, _labels: Labels<'_>) {}
    fn observe(&self, _histogram: &str, _labels: Labels<'_>, _value: f64) {}
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramRollup {
    pub series: String,
    pub sample_count: usize,
    pub p50: f64,
    pub p95: f64,
    pub max: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub counters: Vec<(String, u64)>,
    pub histograms: Vec<HistogramRollup>,
}

/// In-memory counters and bounded histograms
#[derive(Default)]
pub struct MetricsRecorder {
    counters: Mutex<HashMap<String, u64>>,
    histograms: Mutex<HashMap<String, VecDeque<f64>>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter series, 0 if never incremented
    pub fn counter(&self, counter: &str, labels: Labels<'_>) -> u64 {
        self.counters
            .lock()
            .get(&series_key(counter, labels))
            .copied()
            .unwrap_or(0)
    }

    /// Sum across every label combination of a counter
    pub fn counter_total(&self, counter: &str) -> u64 {
        self.counters
            .lock()
            .iter()
            .filter(|(key, _)| key.as_str() == counter || key.starts_with(&format!("{}{{", counter)))
            .map(|(_, v)| *v)
            .sum()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut counters: Vec<(String, u64)> = self
            .counters
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        counters.sort();

        let mut histograms: Vec<HistogramRollup> = self
            .histograms
            .lock()
            .iter()
            .map(|(series, samples)| {
                let mut values: Vec<f64> = samples.iter().copied().collect();
                values.sort_by(|a, b| a.total_cmp(b));
                HistogramRollup {
                    series: series.clone(),
                    sample_count: values.len(),
                    p50: percentile(&values, 50.0).unwrap_or(0.0),
                    p95: percentile(&values, 95.0).unwrap_or(0.0),
                    max: values.last().copied().unwrap_or(0.0),
                }
            })
            .collect();
        histograms.sort_by(|a, b| a.series.cmp(&b.series));

        MetricsSnapshot {
            counters,
            histograms,
        }
    }
}

impl MetricsSink for MetricsRecorder {
    fn increment(&self, counter: &str, labels: Labels<'_>) {
        *self
            .counters
            .lock()
            .entry(series_key(counter, labels))
            .or_insert(0) += 1;
    }

    fn observe(&self, histogram: &str, labels: Labels<'_>, value: f64) {
        let mut histograms = self.histograms.lock();
        let window = histograms.entry(series_key(histogram, labels)).or_default();
        if window.len() >= MAX_SAMPLES_PER_SERIES {
            window.pop_front();
        }
        window.push_back(value);
    }
}

/// `name{k1="v1",k2="v2"}` with labels in the order given
fn series_key(name: &str, labels: Labels<'_>) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let rendered: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v))
        .collect();
    format!("{}{{{}}}", name, rendered.join(","))
}

fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let n = values.len();
    let rank = ((p / 100.0) * n as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(n - 1);
    Some(values[idx])
}
