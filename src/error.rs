use std::path::PathBuf;

use thiserror::Error;

/// Why a single record produced no observation.
#[derive(Debug, Error)]
pub enum MeasurementError {
    #[error("payload is empty")]
    EmptyPayload,
    #[error("payload is not a valid JSON document: {source}")]
    MalformedPayload {
        #[source]
        source: serde_json::Error,
    },
    #[error("no node found at '{reference}'")]
    FieldNotFound { reference: String },
    #[error("node at '{reference}' is not textual")]
    FieldNotTextual { reference: String },
    #[error("cannot parse timestamp '{value}' at '{reference}'")]
    TimestampParseError { reference: String, value: String },
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("cannot create histogram: {source}")]
    Create {
        #[source]
        source: hdrhistogram::CreationError,
    },
    #[error("histogram rejected sample {value}: {source}")]
    Histogram {
        value: i64,
        #[source]
        source: hdrhistogram::RecordError,
    },
    #[error("cannot merge histograms: {source}")]
    Merge {
        #[source]
        source: hdrhistogram::AdditionError,
    },
}

/// Errors raised while pushing aggregates to the metrics backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("metrics backend unavailable: {message}")]
    Unavailable { message: String },
    #[error("metrics backend rejected credentials: {message}")]
    Auth { message: String },
}

#[derive(Debug, Error)]
pub enum ReporterError {
    #[error("reporter is already running")]
    AlreadyRunning,
    #[error("reporter was stopped and cannot be restarted")]
    Stopped,
    #[error("reporter must be started from within a Tokio runtime")]
    NoRuntime,
    #[error("report interval must be greater than zero")]
    ZeroInterval,
    #[error("report interval of {}s exceeds the 30 day limit", .interval.as_secs())]
    IntervalTooLong { interval: std::time::Duration },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config '{path}': {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML config '{path}': {source}")]
    ParseToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to parse JSON config '{path}': {source}")]
    ParseJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Unsupported config extension '{ext}'. Use .toml or .json.")]
    UnsupportedExtension { ext: String },
    #[error("Config file must have .toml or .json extension.")]
    MissingExtension,
    #[error("Config 'start-property' is required.")]
    MissingStartProperty,
    #[error("Invalid cloudwatch-metric-time-unit '{value}'.")]
    InvalidTimeUnit { value: String },
    #[error("Invalid cloudwatch-flush-mode '{value}'. Use 'cumulative' or 'delta'.")]
    InvalidFlushMode { value: String },
    #[error("Config 'report-frequency' must be >= 1.")]
    ReportFrequencyZero,
    #[error("Config 'report-frequency' must be <= {max} minutes, got {value}.")]
    ReportFrequencyTooLarge { value: u64, max: u64 },
    #[error("Config 'flush-timeout-secs' must be >= 1.")]
    FlushTimeoutZero,
    #[error("Config 'workers' must be >= 1.")]
    WorkersZero,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Reporter(#[from] ReporterError),
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl AppError {
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

pub type AppResult<T> = Result<T, AppError>;
