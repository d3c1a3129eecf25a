use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::pointer;
use crate::config::{StageConfig, TimeUnit};
use crate::error::MeasurementError;

// ─── Clock ───────────────────────────────────────────────────────

/// Source of "now" for records without an end field.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always reports the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

// ─── Extractor ───────────────────────────────────────────────────

/// Computes `end - start` for one payload, in the configured unit.
#[derive(Clone)]
pub struct DeltaExtractor {
    start_property: String,
    end_property: Option<String>,
    time_unit: TimeUnit,
    clock: Arc<dyn Clock>,
}

impl DeltaExtractor {
    pub fn new(config: &StageConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &StageConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            start_property: config.start_property.clone(),
            end_property: config.end_property.clone(),
            time_unit: config.time_unit,
            clock,
        }
    }

    /// Measures the delta carried by `payload`.
    ///
    /// The result may be negative when the end timestamp precedes the
    /// start timestamp; such values are returned unchanged.
    ///
    /// # Errors
    ///
    /// `EmptyPayload` for a missing or zero-length payload,
    /// `MalformedPayload` when it is not JSON, and any resolver error for
    /// the start or end field.
    pub fn compute_delta(&self, payload: Option<&[u8]>) -> Result<i64, MeasurementError> {
        let payload = match payload {
            Some(bytes) if !bytes.is_empty() => bytes,
            _ => return Err(MeasurementError::EmptyPayload),
        };

        let root: Value = serde_json::from_slice(payload)
            .map_err(|source| MeasurementError::MalformedPayload { source })?;

        let start = pointer::resolve(&root, &self.start_property)?;
        let end = match &self.end_property {
            Some(reference) => pointer::resolve(&root, reference)?,
            None => self.clock.now(),
        };

        let millis = end
            .timestamp_millis()
            .saturating_sub(start.timestamp_millis());
        Ok(self.time_unit.from_millis(millis))
    }
}
