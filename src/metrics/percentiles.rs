use serde::Serialize;

use super::histogram::SignedHistogram;

/// Statistic set for one metric: the exact aggregates plus quantiles.
/// Serialized straight into backend datums and the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PercentileSet {
    pub count: u64,
    pub sum: i64,
    pub min: i64,
    pub max: i64,
    pub mean: f64,
    pub p50: i64,
    pub p95: i64,
    pub p99: i64,
    pub p999: i64,
}

impl PercentileSet {
    /// Extract a full percentile set from a histogram.
    /// Returns zeroed values if the histogram is empty.
    pub fn from_histogram(hist: &SignedHistogram) -> Self {
        let (Some(min), Some(max)) = (hist.min(), hist.max()) else {
            return Self::empty();
        };

        Self {
            count: hist.count(),
            sum: hist.sum(),
            min,
            max,
            mean: hist.mean(),
            p50: hist.value_at_quantile(0.50),
            p95: hist.value_at_quantile(0.95),
            p99: hist.value_at_quantile(0.99),
            p999: hist.value_at_quantile(0.999),
        }
    }

    /// All-zero placeholder used before any samples are recorded.
    pub const fn empty() -> Self {
        Self {
            count: 0,
            sum: 0,
            min: 0,
            max: 0,
            mean: 0.0,
            p50: 0,
            p95: 0,
            p99: 0,
            p999: 0,
        }
    }

    pub const fn has_data(&self) -> bool {
        self.count > 0
    }
}
