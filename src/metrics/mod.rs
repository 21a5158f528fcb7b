//! Fire-and-forget metrics.
//!
//! Labels are restricted to `(provider, action, reason)`. Providers and actions
//! come from configuration and `reason` is a `&'static str` from a fixed set,
//! so label cardinality stays bounded. Workspace and actor ids never appear.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Counter and histogram names emitted by this crate.
pub mod names {
    pub const CREDENTIAL_REFRESH: &str = "credential_refresh";
    pub const CREDENTIAL_CACHE: &str = "credential_cache";
    pub const RATE_LIMIT_DECISION: &str = "rate_limit_decision";
    pub const RATE_LIMIT_DEGRADED: &str = "rate_limit_degraded";
    pub const EXECUTION: &str = "execution";
    pub const EXECUTION_LATENCY_MS: &str = "execution_latency_ms";
    pub const PREVIEW: &str = "preview";
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct MetricLabels {
    pub provider: String,
    pub action: String,
    pub reason: &'static str,
}

impl MetricLabels {
    pub fn new(provider: &str, action: &str, reason: &'static str) -> Self {
        Self {
            provider: provider.to_string(),
            action: action.to_string(),
            reason,
        }
    }

    pub fn reason(reason: &'static str) -> Self {
        Self {
            reason,
            ..Self::default()
        }
    }
}

pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &'static str, labels: &MetricLabels);

    fn observe_ms(&self, name: &'static str, labels: &MetricLabels, value_ms: u64);
}

/// Emits every metric as a `tracing` debug event.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment(&self, name: &'static str, labels: &MetricLabels) {
        debug!(
            metric = name,
            provider = %labels.provider,
            action = %labels.action,
            reason = labels.reason,
            "counter"
        );
    }

    fn observe_ms(&self, name: &'static str, labels: &MetricLabels, value_ms: u64) {
        debug!(
            metric = name,
            provider = %labels.provider,
            action = %labels.action,
            reason = labels.reason,
            value_ms,
            "histogram"
        );
    }
}

#[derive(Default)]
struct Histogram {
    count: AtomicU64,
    sum_ms: AtomicU64,
}

/// In-memory aggregation, queried by the operator tooling and tests.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: DashMap<(&'static str, MetricLabels), AtomicU64>,
    histograms: DashMap<(&'static str, MetricLabels), Histogram>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of a counter across all labels with the given reason.
    pub fn count(&self, name: &str, reason: &str) -> u64 {
        self.counters
            .iter()
            .filter(|entry| entry.key().0 == name && entry.key().1.reason == reason)
            .map(|entry| entry.value().load(Ordering::Relaxed))
            .sum()
    }

    /// Sum of a counter across all labels.
    pub fn total(&self, name: &str) -> u64 {
        self.counters
            .iter()
            .filter(|entry| entry.key().0 == name)
            .map(|entry| entry.value().load(Ordering::Relaxed))
            .sum()
    }

    /// Number of observations and their mean for a histogram.
    pub fn histogram(&self, name: &str) -> (u64, f64) {
        let (count, sum) = self
            .histograms
            .iter()
            .filter(|entry| entry.key().0 == name)
            .fold((0u64, 0u64), |(count, sum), entry| {
                (
                    count + entry.value().count.load(Ordering::Relaxed),
                    sum + entry.value().sum_ms.load(Ordering::Relaxed),
                )
            });
        let mean = if count == 0 { 0.0 } else { sum as f64 / count as f64 };
        (count, mean)
    }
}

impl MetricsSink for MetricsRecorder {
    fn increment(&self, name: &'static str, labels: &MetricLabels) {
        self.counters
            .entry((name, labels.clone()))
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    fn observe_ms(&self, name: &'static str, labels: &MetricLabels, value_ms: u64) {
        let entry = self.histograms.entry((name, labels.clone())).or_default();
        entry.count.fetch_add(1, Ordering::Relaxed);
        entry.sum_ms.fetch_add(value_ms, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_by_reason() {
        let recorder = MetricsRecorder::new();

        recorder.increment(names::EXECUTION, &MetricLabels::new("github", "issue.create", "success"));
        recorder.increment(names::EXECUTION, &MetricLabels::new("gmail", "mail.send", "success"));
        recorder.increment(
            names::EXECUTION,
            &MetricLabels::new("gmail", "mail.send", "downstream_timeout"),
        );

        assert_eq!(recorder.count(names::EXECUTION, "success"), 2);
        assert_eq!(recorder.count(names::EXECUTION, "downstream_timeout"), 1);
        assert_eq!(recorder.total(names::EXECUTION), 3);
        assert_eq!(recorder.total(names::PREVIEW), 0);
    }

    #[test]
    fn test_histogram_mean() {
        let recorder = MetricsRecorder::new();
        let labels = MetricLabels::reason("success");

        recorder.observe_ms(names::EXECUTION_LATENCY_MS, &labels, 10);
        recorder.observe_ms(names::EXECUTION_LATENCY_MS, &labels, 30);

        let (count, mean) = recorder.histogram(names::EXECUTION_LATENCY_MS);
        assert_eq!(count, 2);
        assert!((mean - 20.0).abs() < f64::EPSILON);
    }
}
