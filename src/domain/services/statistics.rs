//! Window Statistics Service
//!
//! Pure summary statistics and trend detection over metric samples.
//! Callers select the samples of the trailing window; nothing here reads
//! the clock.

use crate::domain::value_objects::TrendDirection;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Relative change below which a trend is reported as stable.
pub const STABLE_THRESHOLD: f64 = 0.05;

/// Number of sub-periods a trend window is split into.
pub const TREND_PERIODS: usize = 4;

/// Summary of the samples in one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub stdev: f64,
    /// Percentiles; `None` when the window is too small to rank them
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p50: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p75: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p90: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p95: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p99: Option<f64>,
}

/// Direction and size of a change over a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trend {
    pub direction: TrendDirection,
    /// |last - first| relative to the largest sub-period mean
    pub magnitude: f64,
    pub period_means: Vec<f64>,
}

/// Summarize a set of values. Returns None for an empty set.
pub fn summarize(values: &[f64]) -> Option<WindowStats> {
    if values.is_empty() {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let count = sorted.len();
    let mean = sorted.iter().sum::<f64>() / count as f64;

    let median = if count % 2 == 0 {
        (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
    } else {
        sorted[count / 2]
    };

    // Sample standard deviation
    let stdev = if count > 1 {
        let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
        variance.sqrt()
    } else {
        0.0
    };

    Some(WindowStats {
        count,
        min: sorted[0],
        max: sorted[count - 1],
        mean,
        median,
        stdev,
        p50: percentile(&sorted, 50.0),
        p75: percentile(&sorted, 75.0),
        p90: percentile(&sorted, 90.0),
        p95: percentile(&sorted, 95.0),
        p99: percentile(&sorted, 99.0),
    })
}

/// Percentile of an ascending slice, taken at rank `floor(p/100 * n)`.
///
/// Returns None when that rank is zero, which for the reported percentiles
/// means a single-sample window.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    let rank = ((p / 100.0) * sorted.len() as f64).floor() as usize;
    match rank {
        0 => None,
        r => sorted.get(r.min(sorted.len()) - 1).copied(),
    }
}

/// Split `[start, start + window]` into four equal periods and compare the
/// mean of the first with the mean of the last.
///
/// Samples before `start` are ignored; samples past the end land in the
/// last period. Empty periods average to zero.
pub fn trend(samples: &[(Instant, f64)], start: Instant, window: Duration) -> Option<Trend> {
    let in_window: Vec<&(Instant, f64)> = samples.iter().filter(|(t, _)| *t >= start).collect();
    if in_window.is_empty() {
        return None;
    }

    let period = window.as_secs_f64() / TREND_PERIODS as f64;
    let mut sums = [0.0; TREND_PERIODS];
    let mut counts = [0usize; TREND_PERIODS];

    for (timestamp, value) in in_window {
        let offset = timestamp.duration_since(start).as_secs_f64();
        let index = if period > 0.0 {
            ((offset / period) as usize).min(TREND_PERIODS - 1)
        } else {
            TREND_PERIODS - 1
        };
        sums[index] += value;
        counts[index] += 1;
    }

    let period_means: Vec<f64> = sums
        .iter()
        .zip(counts.iter())
        .map(|(sum, n)| if *n == 0 { 0.0 } else { sum / *n as f64 })
        .collect();

    let first = period_means[0];
    let last = period_means[TREND_PERIODS - 1];
    let largest = period_means.iter().cloned().fold(f64::MIN, f64::max);

    let magnitude = if largest > 0.0 {
        (last - first).abs() / largest
    } else {
        0.0
    };

    let direction = if magnitude < STABLE_THRESHOLD {
        TrendDirection::Stable
    } else if last > first {
        TrendDirection::Increasing
    } else {
        TrendDirection::Decreasing
    };

    Some(Trend {
        direction,
        magnitude,
        period_means,
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    // ===== Summary Tests =====

    #[test]
    fn test_summarize_basic() {
        let stats = summarize(&[10.0, 20.0, 30.0, 40.0, 50.0]).unwrap();
        assert_eq!(stats.count, 5);
        assert_eq!(stats.mean, 30.0);
        assert_eq!(stats.median, 30.0);
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 50.0);
        assert!((stats.stdev - 15.811_388).abs() < 1e-5);
    }

    #[test]
    fn test_summarize_unsorted_even_count() {
        let stats = summarize(&[4.0, 1.0, 3.0, 2.0]).unwrap();
        assert_eq!(stats.median, 2.5);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 4.0);
    }

    #[test]
    fn test_summarize_single_value() {
        let stats = summarize(&[7.0]).unwrap();
        assert_eq!(stats.stdev, 0.0);
        assert_eq!(stats.median, 7.0);
        assert_eq!(stats.p50, None);
        assert_eq!(stats.p99, None);
    }

    #[test]
    fn test_summarize_empty() {
        assert!(summarize(&[]).is_none());
    }

    #[test]
    fn test_percentiles_over_hundred_values() {
        let values: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        let stats = summarize(&values).unwrap();
        assert_eq!(stats.p50, Some(50.0));
        assert_eq!(stats.p75, Some(75.0));
        assert_eq!(stats.p90, Some(90.0));
        assert_eq!(stats.p95, Some(95.0));
        assert_eq!(stats.p99, Some(99.0));
    }

    #[test]
    fn test_percentiles_use_floor_rank() {
        let stats = summarize(&[10.0, 20.0, 30.0, 40.0, 50.0]).unwrap();
        assert_eq!(stats.p50, Some(20.0));
        assert_eq!(stats.p75, Some(30.0));
        assert_eq!(stats.p90, Some(40.0));
        assert_eq!(stats.p95, Some(40.0));
        assert_eq!(stats.p99, Some(40.0));
        // median is exact, not a percentile rank
        assert_eq!(stats.median, 30.0);
    }

    #[test]
    fn test_percentile_below_first_rank_is_omitted() {
        assert_eq!(percentile(&[1.0, 2.0, 3.0], 30.0), None);
        assert_eq!(percentile(&[1.0, 2.0, 3.0], 34.0), Some(1.0));
        assert_eq!(percentile(&[1.0, 2.0, 3.0], 100.0), Some(3.0));
        assert_eq!(percentile(&[], 50.0), None);

        let json = serde_json::to_value(summarize(&[7.0]).unwrap()).unwrap();
        assert!(json.get("p50").is_none());
    }

    // ===== Trend Tests =====

    fn spread(start: Instant, values: &[f64]) -> Vec<(Instant, f64)> {
        // one value per 10s over a 40s window
        values
            .iter()
            .enumerate()
            .map(|(i, v)| (start + Duration::from_secs(i as u64 * 10 + 1), *v))
            .collect()
    }

    #[test]
    fn test_trend_increasing() {
        let start = Instant::now();
        let samples = spread(start, &[10.0, 20.0, 30.0, 40.0]);
        let trend = trend(&samples, start, Duration::from_secs(40)).unwrap();

        assert_eq!(trend.direction, TrendDirection::Increasing);
        assert!((trend.magnitude - 0.75).abs() < 1e-9);
        assert_eq!(trend.period_means, vec![10.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn test_trend_decreasing() {
        let start = Instant::now();
        let samples = spread(start, &[40.0, 30.0, 20.0, 10.0]);
        let trend = trend(&samples, start, Duration::from_secs(40)).unwrap();
        assert_eq!(trend.direction, TrendDirection::Decreasing);
    }

    #[test]
    fn test_trend_stable_within_threshold() {
        let start = Instant::now();
        let samples = spread(start, &[100.0, 101.0, 99.0, 102.0]);
        let trend = trend(&samples, start, Duration::from_secs(40)).unwrap();
        assert_eq!(trend.direction, TrendDirection::Stable);
    }

    #[test]
    fn test_trend_empty_period_counts_as_zero() {
        let start = Instant::now();
        let samples = vec![(start + Duration::from_secs(35), 50.0)];
        let trend = trend(&samples, start, Duration::from_secs(40)).unwrap();

        assert_eq!(trend.period_means, vec![0.0, 0.0, 0.0, 50.0]);
        assert_eq!(trend.direction, TrendDirection::Increasing);
        assert_eq!(trend.magnitude, 1.0);
    }

    #[test]
    fn test_trend_ignores_samples_before_start() {
        let start = Instant::now() + Duration::from_secs(5);
        let samples = vec![(start - Duration::from_secs(1), 1.0)];
        assert!(trend(&samples, start, Duration::from_secs(40)).is_none());
    }

    #[test]
    fn test_trend_all_zero_is_stable() {
        let start = Instant::now();
        let samples = spread(start, &[0.0, 0.0, 0.0, 0.0]);
        let trend = trend(&samples, start, Duration::from_secs(40)).unwrap();
        assert_eq!(trend.magnitude, 0.0);
        assert_eq!(trend.direction, TrendDirection::Stable);
    }
}
