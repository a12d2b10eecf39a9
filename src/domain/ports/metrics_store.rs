//! Metrics Store Port
//!
//! Defines the interface for storing and querying metric time series.

use crate::domain::entities::{Labels, MetricSample};
use crate::domain::services::statistics::{Trend, WindowStats};
use crate::domain::value_objects::MetricType;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Overview of a metrics store.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSummary {
    pub total_metrics: usize,
    pub total_samples: usize,
    /// Metrics with a sample inside the store's active window
    pub active_metrics: Vec<String>,
}

/// Store for metric time series.
///
/// This is an outbound port. The alert engine reads the latest samples
/// through it and the optimizer records call latencies and component gauges.
pub trait MetricsStore: Send + Sync {
    /// Declare a metric with its type. Re-registering keeps existing samples.
    fn register(&self, name: &str, metric_type: MetricType, description: &str);

    /// Append a sample stamped now, creating a gauge if the name is unknown.
    fn record(&self, name: &str, value: f64, labels: Labels);

    /// Append a sample with an explicit timestamp, kept in time order.
    fn record_at(&self, name: &str, value: f64, labels: Labels, timestamp: Instant);

    /// Most recent sample of a metric.
    fn latest(&self, name: &str) -> Option<MetricSample>;

    /// Summary statistics over the trailing window.
    fn stats(&self, name: &str, window: Duration) -> Option<WindowStats>;

    /// Trend over the trailing window.
    fn trend(&self, name: &str, window: Duration) -> Option<Trend>;

    /// Names of every known metric, sorted.
    fn metric_names(&self) -> Vec<String>;

    fn summary(&self) -> MetricsSummary;
}
