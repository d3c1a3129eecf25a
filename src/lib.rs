//! A stream stage that measures the time between two timestamp fields of
//! each record, aggregates the deltas into a histogram and periodically
//! flushes it to a metrics backend, forwarding every record unchanged.

pub mod config;
pub mod error;
pub mod extract;
pub mod host;
pub mod logger;
pub mod metrics;
pub mod reporter;
pub mod server;
pub mod stage;

pub use config::{FlushMode, StageConfig, StageSettings, TimeUnit};
pub use error::{AppError, AppResult, BackendError, MeasurementError, ReporterError};
pub use extract::{Clock, DeltaExtractor, FixedClock, SystemClock};
pub use metrics::{MetricSink, MetricSnapshot, PercentileSet, SinkView};
pub use reporter::{LogBackend, MetricDatum, MetricsBackend, PeriodicReporter, ReporterSettings};
pub use stage::{Anchor, FieldTimeDeltaStage, OutputCollector, Record, Tuple};
