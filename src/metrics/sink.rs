use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use super::histogram::SignedHistogram;
use super::percentiles::PercentileSet;
use crate::error::RecordError;

// ─── Public types ────────────────────────────────────────────────

/// Thread-safe aggregation surface, one histogram per metric name.
/// Record paths call `observe()`, the reporter reads through a [`SinkView`].
#[derive(Debug, Default)]
pub struct MetricSink {
    inner: Mutex<HashMap<String, SignedHistogram>>,
}

/// Point-in-time statistics for one metric.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSnapshot {
    pub name: String,
    pub stats: PercentileSet,
}

/// Aggregates removed from the sink by [`SinkView::drain`].
pub type Drained = HashMap<String, SignedHistogram>;

// ─── MetricSink impl ─────────────────────────────────────────────

impl MetricSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sample under `name`, creating the histogram on first use.
    ///
    /// # Errors
    ///
    /// Fails only if the histogram cannot be created or cannot hold the value.
    pub fn observe(&self, name: &str, value: i64) -> Result<(), RecordError> {
        let mut inner = self.inner.lock();
        if let Some(hist) = inner.get_mut(name) {
            return hist.record(value);
        }

        let mut hist =
            SignedHistogram::new().map_err(|source| RecordError::Create { source })?;
        hist.record(value)?;
        inner.insert(name.to_owned(), hist);
        Ok(())
    }

    /// Statistics for a single metric, if it has been observed.
    pub fn get(&self, name: &str) -> Option<PercentileSet> {
        self.inner.lock().get(name).map(PercentileSet::from_histogram)
    }

    /// Statistics for every metric, ordered by name.
    pub fn snapshot(&self) -> Vec<MetricSnapshot> {
        let inner = self.inner.lock();
        let mut snapshots: Vec<_> = inner
            .iter()
            .map(|(name, hist)| MetricSnapshot {
                name: name.clone(),
                stats: PercentileSet::from_histogram(hist),
            })
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Read-side handle for the reporter and status endpoint.
    pub fn view(self: &Arc<Self>) -> SinkView {
        SinkView {
            sink: Arc::clone(self),
        }
    }

    fn take(&self) -> Drained {
        std::mem::take(&mut *self.inner.lock())
    }

    fn restore(&self, drained: Drained) -> Result<(), RecordError> {
        let mut inner = self.inner.lock();
        for (name, hist) in drained {
            match inner.get_mut(&name) {
                Some(current) => current.merge(&hist)?,
                None => {
                    inner.insert(name, hist);
                }
            }
        }
        Ok(())
    }
}

// ─── Read-side view ──────────────────────────────────────────────

/// Collection-only access to a [`MetricSink`]. Cannot observe samples.
#[derive(Debug, Clone)]
pub struct SinkView {
    sink: Arc<MetricSink>,
}

impl SinkView {
    pub fn snapshot(&self) -> Vec<MetricSnapshot> {
        self.sink.snapshot()
    }

    /// Removes and returns every aggregate, leaving the sink empty.
    pub fn drain(&self) -> Drained {
        self.sink.take()
    }

    /// Merges previously drained aggregates back into the sink.
    ///
    /// # Errors
    ///
    /// Fails if a histogram merge fails.
    pub fn restore(&self, drained: Drained) -> Result<(), RecordError> {
        self.sink.restore(drained)
    }
}
