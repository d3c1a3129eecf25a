use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::BackendError;
use crate::metrics::PercentileSet;

/// One metric's statistics as pushed to the backend.
#[derive(Debug, Clone, Serialize)]
pub struct MetricDatum {
    pub name: String,
    /// Backend unit label, e.g. `Seconds`
    pub unit: &'static str,
    pub timestamp: DateTime<Utc>,
    pub stats: PercentileSet,
}

/// External metrics service the reporter pushes to.
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    /// # Errors
    ///
    /// `Unavailable` for transport failures, `Auth` when credentials are
    /// rejected.
    async fn put_metric_data(
        &self,
        namespace: &str,
        data: &[MetricDatum],
    ) -> Result<(), BackendError>;
}

/// Writes every datum as a structured log event.
#[derive(Debug, Clone)]
pub struct LogBackend {
    region: String,
}

impl LogBackend {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
        }
    }
}

#[async_trait]
impl MetricsBackend for LogBackend {
    async fn put_metric_data(
        &self,
        namespace: &str,
        data: &[MetricDatum],
    ) -> Result<(), BackendError> {
        for datum in data {
            let stats = &datum.stats;
            info!(
                namespace,
                region = %self.region,
                metric = %datum.name,
                unit = datum.unit,
                count = stats.count,
                sum = stats.sum,
                min = stats.min,
                max = stats.max,
                p50 = stats.p50,
                p99 = stats.p99,
                "metric datum"
            );
        }
        Ok(())
    }
}
