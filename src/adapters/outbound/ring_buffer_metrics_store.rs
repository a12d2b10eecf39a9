//! Ring Buffer Metrics Store
//!
//! Implements MetricsStore using DashMap with a capacity-capped,
//! time-ordered ring buffer per metric.

use crate::config::ConfigError;
use crate::domain::entities::{Labels, MetricSample};
use crate::domain::ports::{MetricsExport, MetricsStore, MetricsSummary};
use crate::domain::services::statistics::{self, Trend, WindowStats};
use crate::domain::value_objects::MetricType;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Metric store configuration.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Samples kept per metric before the oldest is dropped
    pub sample_capacity: usize,
    /// A metric with a sample this recent counts as active in the summary
    pub active_window: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            sample_capacity: 10_000,
            active_window: Duration::from_secs(300),
        }
    }
}

impl MetricsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_capacity(mut self, capacity: usize) -> Self {
        self.sample_capacity = capacity;
        self
    }

    pub fn active_window(mut self, window: Duration) -> Self {
        self.active_window = window;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_capacity == 0 {
            return Err(ConfigError::Zero("sample_capacity"));
        }
        Ok(())
    }
}

/// Samples and metadata of one metric.
#[derive(Debug)]
struct MetricSeries {
    metric_type: MetricType,
    description: String,
    samples: VecDeque<MetricSample>,
}

impl MetricSeries {
    fn new(metric_type: MetricType, description: &str) -> Self {
        Self {
            metric_type,
            description: description.to_string(),
            samples: VecDeque::new(),
        }
    }

    /// Insert keeping time order, then drop from the front past capacity.
    fn insert(&mut self, sample: MetricSample, capacity: usize) {
        let in_order = self
            .samples
            .back()
            .map(|last| last.timestamp <= sample.timestamp)
            .unwrap_or(true);

        if in_order {
            self.samples.push_back(sample);
        } else {
            let pos = self
                .samples
                .partition_point(|s| s.timestamp <= sample.timestamp);
            self.samples.insert(pos, sample);
        }

        while self.samples.len() > capacity {
            self.samples.pop_front();
        }
    }

    fn window(&self, cutoff: Option<Instant>) -> impl Iterator<Item = &MetricSample> {
        self.samples
            .iter()
            .filter(move |s| cutoff.map(|c| s.timestamp >= c).unwrap_or(true))
    }
}

/// DashMap-backed metric store.
///
/// Each metric has its own entry, so writers to different metrics only
/// contend when they hash to the same shard.
pub struct RingBufferMetricsStore {
    config: MetricsConfig,
    series: DashMap<String, MetricSeries>,
}

impl RingBufferMetricsStore {
    /// Create a new metric store.
    pub fn new(config: MetricsConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            series: DashMap::new(),
        })
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Number of stored samples for a metric.
    pub fn sample_count(&self, name: &str) -> usize {
        self.series.get(name).map(|s| s.samples.len()).unwrap_or(0)
    }

    /// Type and description of a metric.
    pub fn describe(&self, name: &str) -> Option<(MetricType, String)> {
        self.series
            .get(name)
            .map(|s| (s.metric_type, s.description.clone()))
    }

    /// Values in the trailing window, copied out of the shard lock.
    fn window_values(&self, name: &str, window: Duration) -> Vec<(Instant, f64)> {
        let cutoff = Instant::now().checked_sub(window);
        self.series
            .get(name)
            .map(|s| s.window(cutoff).map(|m| (m.timestamp, m.value)).collect())
            .unwrap_or_default()
    }
}

impl Default for RingBufferMetricsStore {
    fn default() -> Self {
        Self {
            config: MetricsConfig::default(),
            series: DashMap::new(),
        }
    }
}

impl MetricsStore for RingBufferMetricsStore {
    fn register(&self, name: &str, metric_type: MetricType, description: &str) {
        let mut series = self
            .series
            .entry(name.to_string())
            .or_insert_with(|| MetricSeries::new(metric_type, description));
        series.metric_type = metric_type;
        series.description = description.to_string();
    }

    fn record(&self, name: &str, value: f64, labels: Labels) {
        self.record_at(name, value, labels, Instant::now());
    }

    fn record_at(&self, name: &str, value: f64, labels: Labels, timestamp: Instant) {
        let sample = MetricSample {
            value,
            timestamp,
            labels,
        };
        self.series
            .entry(name.to_string())
            .or_insert_with(|| MetricSeries::new(MetricType::Gauge, ""))
            .insert(sample, self.config.sample_capacity);
    }

    fn latest(&self, name: &str) -> Option<MetricSample> {
        self.series.get(name).and_then(|s| s.samples.back().cloned())
    }

    fn stats(&self, name: &str, window: Duration) -> Option<WindowStats> {
        let values: Vec<f64> = self
            .window_values(name, window)
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        statistics::summarize(&values)
    }

    fn trend(&self, name: &str, window: Duration) -> Option<Trend> {
        let samples = self.window_values(name, window);
        let now = Instant::now();
        // Process younger than the window: start at the oldest sample
        let start = now
            .checked_sub(window)
            .or_else(|| samples.first().map(|(t, _)| *t))?;
        statistics::trend(&samples, start, window)
    }

    fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.series.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn summary(&self) -> MetricsSummary {
        let cutoff = Instant::now().checked_sub(self.config.active_window);
        let mut summary = MetricsSummary::default();

        for entry in self.series.iter() {
            summary.total_metrics += 1;
            summary.total_samples += entry.samples.len();

            let active = entry
                .samples
                .back()
                .map(|s| cutoff.map(|c| s.timestamp >= c).unwrap_or(true))
                .unwrap_or(false);
            if active {
                summary.active_metrics.push(entry.key().clone());
            }
        }

        summary.active_metrics.sort();
        summary
    }
}

impl MetricsExport for RingBufferMetricsStore {
    fn export_metrics(&self) -> Vec<(String, f64)> {
        let summary = self.summary();
        let mut out = vec![
            ("metrics.total_metrics".to_string(), summary.total_metrics as f64),
            ("metrics.total_samples".to_string(), summary.total_samples as f64),
        ];
        for name in self.metric_names() {
            if let Some(sample) = self.latest(&name) {
                out.push((name, sample.value));
            }
        }
        out
    }
}
