use hdrhistogram::Histogram;

use crate::error::RecordError;

/// 3 significant figures, auto-resizing range
const HIST_SIGFIG: u8 = 3;

/// Histogram over signed samples.
///
/// HdrHistogram only tracks unsigned values, so non-negative samples and
/// the magnitudes of negative samples live in two separate histograms.
/// `count`, `sum`, `min` and `max` are exact; quantiles carry HdrHistogram
/// precision.
#[derive(Debug, Clone)]
pub struct SignedHistogram {
    non_negative: Histogram<u64>,
    negative: Histogram<u64>,
    sum: i128,
    min: i64,
    max: i64,
}

impl SignedHistogram {
    /// # Errors
    ///
    /// Propagates HdrHistogram construction failures.
    pub fn new() -> Result<Self, hdrhistogram::CreationError> {
        Ok(Self {
            non_negative: Histogram::new(HIST_SIGFIG)?,
            negative: Histogram::new(HIST_SIGFIG)?,
            sum: 0,
            min: i64::MAX,
            max: i64::MIN,
        })
    }

    /// # Errors
    ///
    /// Fails if the underlying histogram cannot grow to hold the value.
    pub fn record(&mut self, value: i64) -> Result<(), RecordError> {
        let target = if value < 0 {
            &mut self.negative
        } else {
            &mut self.non_negative
        };
        target
            .record(value.unsigned_abs())
            .map_err(|source| RecordError::Histogram { value, source })?;

        self.sum += i128::from(value);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        Ok(())
    }

    /// Folds `other` into `self`.
    ///
    /// # Errors
    ///
    /// Fails if the histograms cannot be added.
    pub fn merge(&mut self, other: &Self) -> Result<(), RecordError> {
        self.non_negative
            .add(&other.non_negative)
            .map_err(|source| RecordError::Merge { source })?;
        self.negative
            .add(&other.negative)
            .map_err(|source| RecordError::Merge { source })?;

        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.non_negative.len() + self.negative.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Sum of all samples, saturated into `i64`.
    pub fn sum(&self) -> i64 {
        i64::try_from(self.sum).unwrap_or(if self.sum < 0 { i64::MIN } else { i64::MAX })
    }

    pub fn min(&self) -> Option<i64> {
        (!self.is_empty()).then_some(self.min)
    }

    pub fn max(&self) -> Option<i64> {
        (!self.is_empty()).then_some(self.max)
    }

    pub fn mean(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.sum as f64 / n as f64,
        }
    }

    /// Value below which `quantile` of all samples fall.
    pub fn value_at_quantile(&self, quantile: f64) -> i64 {
        let negatives = self.negative.len();
        let total = negatives + self.non_negative.len();
        if total == 0 {
            return 0;
        }

        // 1-based rank of the requested sample in ascending order
        let rank = ((quantile.clamp(0.0, 1.0) * total as f64).ceil() as u64).max(1);

        let value = if rank <= negatives {
            // ascending values are descending magnitudes
            let k = negatives - rank + 1;
            let magnitude = self
                .negative
                .value_at_quantile(k as f64 / negatives as f64);
            0i64.saturating_sub_unsigned(magnitude)
        } else {
            let k = rank - negatives;
            let value = self
                .non_negative
                .value_at_quantile(k as f64 / self.non_negative.len() as f64);
            i64::try_from(value).unwrap_or(i64::MAX)
        };

        value.clamp(self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hist(values: &[i64]) -> SignedHistogram {
        let mut h = SignedHistogram::new().unwrap();
        for v in values {
            h.record(*v).unwrap();
        }
        h
    }

    #[test]
    fn empty_histogram_has_no_bounds() {
        let h = SignedHistogram::new().unwrap();
        assert!(h.is_empty());
        assert_eq!(h.min(), None);
        assert_eq!(h.max(), None);
        assert_eq!(h.value_at_quantile(0.5), 0);
    }

    #[test]
    fn exact_stats_over_mixed_signs() {
        let h = hist(&[-10, -2, 0, 5, 7]);
        assert_eq!(h.count(), 5);
        assert_eq!(h.sum(), 0);
        assert_eq!(h.min(), Some(-10));
        assert_eq!(h.max(), Some(7));
    }

    #[test]
    fn quantiles_span_negative_and_positive_samples() {
        let h = hist(&[-10, -2, 0, 5, 7]);
        assert_eq!(h.value_at_quantile(0.0), -10);
        assert_eq!(h.value_at_quantile(0.2), -10);
        assert_eq!(h.value_at_quantile(0.4), -2);
        assert_eq!(h.value_at_quantile(0.5), 0);
        assert_eq!(h.value_at_quantile(0.8), 5);
        assert_eq!(h.value_at_quantile(1.0), 7);
    }

    #[test]
    fn large_magnitudes_are_recorded() {
        let h = hist(&[-(1 << 45), 1 << 45, 3]);
        assert_eq!(h.count(), 3);
        assert_eq!(h.min(), Some(-(1 << 45)));
        assert_eq!(h.max(), Some(1 << 45));
        assert_eq!(h.sum(), 3);
        assert_eq!(h.value_at_quantile(0.5), 3);
    }

    #[test]
    fn merge_combines_counts_and_bounds() {
        let mut left = hist(&[1, 2, 3]);
        let right = hist(&[-4, 100]);
        left.merge(&right).unwrap();

        assert_eq!(left.count(), 5);
        assert_eq!(left.sum(), 102);
        assert_eq!(left.min(), Some(-4));
        assert_eq!(left.max(), Some(100));
    }
}
