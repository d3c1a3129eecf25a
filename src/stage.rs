use std::borrow::Cow;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tracing::{debug, error};

use crate::config::StageConfig;
use crate::error::MeasurementError;
use crate::extract::DeltaExtractor;
use crate::metrics::MetricSink;

// ─── Records ─────────────────────────────────────────────────────

/// `(id, payload, metadata)`. Each field keeps its exact JSON text, so a
/// forwarded record serializes to the same bytes it was read from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record(pub Box<RawValue>, pub Box<RawValue>, pub Box<RawValue>);

impl Record {
    /// Builds a record from the JSON text of each field.
    ///
    /// # Errors
    ///
    /// Fails if any field is not valid JSON.
    pub fn from_json(id: &str, payload: &str, metadata: &str) -> Result<Self, serde_json::Error> {
        Ok(Self(
            RawValue::from_string(id.to_owned())?,
            RawValue::from_string(payload.to_owned())?,
            RawValue::from_string(metadata.to_owned())?,
        ))
    }

    /// Record whose payload field is `document` carried as a JSON string,
    /// or `null` when absent.
    ///
    /// # Errors
    ///
    /// Fails if `id` or `metadata` is not valid JSON.
    pub fn with_document(
        id: &str,
        document: Option<&str>,
        metadata: &str,
    ) -> Result<Self, serde_json::Error> {
        let payload = match document {
            Some(text) => serde_json::to_string(text)?,
            None => "null".to_owned(),
        };
        Self::from_json(id, &payload, metadata)
    }

    /// Serialized document carried in field 1, if any.
    ///
    /// A JSON string payload is unescaped, `null` means no payload, and any
    /// other JSON value is taken as the document itself.
    pub fn payload(&self) -> Option<Cow<'_, str>> {
        let raw = self.1.get();
        if raw == "null" {
            return None;
        }
        if raw.starts_with('"') {
            if let Ok(text) = serde_json::from_str::<&str>(raw) {
                return Some(Cow::Borrowed(text));
            }
            return serde_json::from_str::<String>(raw).ok().map(Cow::Owned);
        }
        Some(Cow::Borrowed(raw))
    }

    pub fn fields(&self) -> [&str; 3] {
        [self.0.get(), self.1.get(), self.2.get()]
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.fields() == other.fields()
    }
}

impl Eq for Record {}

/// Lineage id linking an emitted record to the inbound one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Anchor(pub u64);

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An inbound record together with its anchor.
#[derive(Debug, Clone)]
pub struct Tuple {
    pub anchor: Anchor,
    pub record: Record,
}

// ─── Host runtime seam ───────────────────────────────────────────

/// Downstream side of the hosting runtime.
pub trait OutputCollector: Send + Sync {
    /// Forwards `record` downstream, anchored to the inbound tuple.
    fn emit(&self, anchor: Anchor, record: Record);

    /// Marks the inbound tuple as fully handled.
    fn ack(&self, anchor: Anchor);
}

/// Acks its anchor when dropped, on every exit path.
struct AckGuard<'a, C: OutputCollector + ?Sized> {
    collector: &'a C,
    anchor: Anchor,
}

impl<C: OutputCollector + ?Sized> Drop for AckGuard<'_, C> {
    fn drop(&mut self) {
        self.collector.ack(self.anchor);
    }
}

// ─── Stage ───────────────────────────────────────────────────────

/// Measures the time between two payload fields and forwards every record
/// unchanged.
pub struct FieldTimeDeltaStage {
    metric_name: String,
    extractor: DeltaExtractor,
    sink: Arc<MetricSink>,
}

impl FieldTimeDeltaStage {
    pub fn new(config: &StageConfig, sink: Arc<MetricSink>) -> Self {
        Self::with_extractor(config, DeltaExtractor::new(config), sink)
    }

    pub fn with_extractor(
        config: &StageConfig,
        extractor: DeltaExtractor,
        sink: Arc<MetricSink>,
    ) -> Self {
        Self {
            metric_name: config.metric_name(),
            extractor,
            sink,
        }
    }

    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    /// Handles one tuple: records a measurement when possible, then emits
    /// the record and acks it. Emits and acks exactly once whatever the
    /// payload contains.
    pub fn process<C: OutputCollector + ?Sized>(&self, tuple: Tuple, collector: &C) {
        let Tuple { anchor, record } = tuple;
        let _ack = AckGuard { collector, anchor };

        // A panicking measurement still emits and acks.
        let measured = panic::catch_unwind(AssertUnwindSafe(|| self.measure(anchor, &record)));
        if measured.is_err() {
            error!(metric = %self.metric_name, %anchor, "measurement panicked");
        }

        collector.emit(anchor, record);
    }

    fn measure(&self, anchor: Anchor, record: &Record) {
        let payload = record.payload();
        let delta = match self
            .extractor
            .compute_delta(payload.as_deref().map(str::as_bytes))
        {
            Ok(delta) => delta,
            Err(MeasurementError::EmptyPayload) => {
                debug!(metric = %self.metric_name, %anchor, "record has no payload");
                return;
            }
            Err(err) => {
                error!(
                    metric = %self.metric_name,
                    %anchor,
                    "error computing timing delta, {err}"
                );
                return;
            }
        };

        if let Err(err) = self.sink.observe(&self.metric_name, delta) {
            error!(metric = %self.metric_name, %anchor, error = %err, "cannot record delta");
        }
    }
}
