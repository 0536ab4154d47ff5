//! Per-cycle response time aggregation

use crate::service::MetricCategory;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// One data point appended to a metric series.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub category: MetricCategory,
    pub value_ms: f64,
}

#[derive(Clone, Copy, Debug, Default)]
struct RunningAverage {
    mean: f64,
    count: u64,
}

impl RunningAverage {
    fn push(&mut self, value: f64) {
        self.count += 1;
        self.mean += (value - self.mean) / self.count as f64;
    }
}

/// Running latency averages for one polling cycle.
///
/// Owned by a single cycle; `flush` hands out the points and starts over.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    averages: BTreeMap<MetricCategory, RunningAverage>,
    emit_empty: bool,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a zero point for categories without observations instead of
    /// skipping them.
    pub fn with_empty_points(mut self, emit_empty: bool) -> Self {
        self.emit_empty = emit_empty;
        self
    }

    /// Record the latency of one successful probe.
    pub fn observe(&mut self, category: MetricCategory, latency_secs: f64) {
        if !latency_secs.is_finite() || latency_secs < 0.0 {
            debug!(%category, latency_secs, "Ignoring invalid latency observation");
            return;
        }

        self.averages.entry(category).or_default().push(latency_secs);
    }

    /// Number of observations recorded for a category since the last flush.
    pub fn count(&self, category: MetricCategory) -> u64 {
        self.averages.get(&category).map_or(0, |avg| avg.count)
    }

    /// Mean latency in milliseconds per observed category; resets all counters.
    pub fn flush(&mut self) -> Vec<MetricPoint> {
        let averages = std::mem::take(&mut self.averages);

        MetricCategory::ALL
            .iter()
            .filter_map(|category| match averages.get(category) {
                Some(avg) if avg.count > 0 => Some(MetricPoint {
                    category: *category,
                    value_ms: avg.mean * 1000.0,
                }),
                _ if self.emit_empty => Some(MetricPoint {
                    category: *category,
                    value_ms: 0.0,
                }),
                _ => {
                    debug!(%category, "No observations this cycle, skipping metric point");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_of(points: &[MetricPoint], category: MetricCategory) -> Option<f64> {
        points
            .iter()
            .find(|point| point.category == category)
            .map(|point| point.value_ms)
    }

    #[test]
    fn test_fleet_mean_in_milliseconds() {
        let mut aggregator = MetricsAggregator::new();
        for latency in [0.1, 0.2, 0.3] {
            aggregator.observe(MetricCategory::FleetLatency, latency);
        }
        assert_eq!(aggregator.count(MetricCategory::FleetLatency), 3);

        let points = aggregator.flush();
        let fleet = value_of(&points, MetricCategory::FleetLatency).unwrap();
        assert!((fleet - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_flush_resets_counters() {
        let mut aggregator = MetricsAggregator::new();
        aggregator.observe(MetricCategory::PrimaryWebsiteLatency, 0.5);
        assert_eq!(aggregator.flush().len(), 1);

        assert_eq!(aggregator.count(MetricCategory::PrimaryWebsiteLatency), 0);
        assert!(aggregator.flush().is_empty());
    }

    #[test]
    fn test_empty_categories_emit_zero_when_enabled() {
        let mut aggregator = MetricsAggregator::new().with_empty_points(true);
        aggregator.observe(MetricCategory::PrimaryServiceLatency, 0.04);

        let points = aggregator.flush();
        assert_eq!(points.len(), 3);
        assert_eq!(value_of(&points, MetricCategory::FleetLatency), Some(0.0));
        assert_eq!(value_of(&points, MetricCategory::PrimaryWebsiteLatency), Some(0.0));
        let primary = value_of(&points, MetricCategory::PrimaryServiceLatency).unwrap();
        assert!((primary - 40.0).abs() < 1e-9);

        // the previous mean must not leak into the next cycle
        let points = aggregator.flush();
        assert_eq!(value_of(&points, MetricCategory::PrimaryServiceLatency), Some(0.0));
    }

    #[test]
    fn test_invalid_latency_ignored() {
        let mut aggregator = MetricsAggregator::new();
        aggregator.observe(MetricCategory::FleetLatency, f64::NAN);
        aggregator.observe(MetricCategory::FleetLatency, -1.0);

        assert_eq!(aggregator.count(MetricCategory::FleetLatency), 0);
    }
}
