use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

// ─── Defaults ────────────────────────────────────────────────────

const DEFAULT_NAME: &str = "FieldTimeDelta";
const DEFAULT_NAMESPACE: &str = "StreamStages";
const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_TOPOLOGY: &str = "local";

/// 30 days, in minutes.
pub const MAX_REPORT_FREQUENCY: u64 = 30 * 24 * 60;

fn default_report_frequency() -> u64 {
    1
}
fn default_flush_timeout_secs() -> u64 {
    10
}
fn default_workers() -> u32 {
    1
}

// ─── Raw file layout ─────────────────────────────────────────────

/// Stage settings exactly as written in the config file.
/// Nothing here is trusted until [`StageSettings::validate`] runs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StageSettings {
    pub cloudwatch_name: Option<String>,
    pub cloudwatch_namespace: Option<String>,
    pub cloudwatch_region_name: Option<String>,
    pub cloudwatch_metric_time_unit: Option<String>,
    pub cloudwatch_flush_mode: Option<String>,

    /// JSON pointer to the start timestamp (required)
    pub start_property: Option<String>,
    /// JSON pointer to the end timestamp; absent means "now"
    pub end_property: Option<String>,

    /// Minutes between flushes
    #[serde(default = "default_report_frequency")]
    pub report_frequency: u64,

    #[serde(default = "default_flush_timeout_secs")]
    pub flush_timeout_secs: u64,

    pub topology_name: Option<String>,

    #[serde(default = "default_workers")]
    pub workers: u32,

    pub status_listen: Option<SocketAddr>,
}

// ─── Validated configuration ─────────────────────────────────────

/// Immutable stage configuration, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageConfig {
    pub name: String,
    pub namespace: String,
    pub region: String,
    pub topology: String,
    pub start_property: String,
    pub end_property: Option<String>,
    pub report_interval: Duration,
    pub time_unit: TimeUnit,
    pub flush_mode: FlushMode,
    pub flush_timeout: Duration,
    pub workers: u32,
    pub status_listen: Option<SocketAddr>,
}

impl StageConfig {
    /// Config with every optional field at its default.
    pub fn new(start_property: impl Into<String>) -> Self {
        Self {
            name: DEFAULT_NAME.to_owned(),
            namespace: DEFAULT_NAMESPACE.to_owned(),
            region: DEFAULT_REGION.to_owned(),
            topology: DEFAULT_TOPOLOGY.to_owned(),
            start_property: start_property.into(),
            end_property: None,
            report_interval: minutes(default_report_frequency()),
            time_unit: TimeUnit::default(),
            flush_mode: FlushMode::default(),
            flush_timeout: Duration::from_secs(default_flush_timeout_secs()),
            workers: default_workers(),
            status_listen: None,
        }
    }

    /// `"{name} Topology={topology} Region={region}"`
    pub fn metric_name(&self) -> String {
        format!(
            "{} Topology={} Region={}",
            self.name, self.topology, self.region
        )
    }
}

impl StageSettings {
    /// Applies defaults and checks every field.
    ///
    /// # Errors
    ///
    /// Fails when `start-property` is missing, the report frequency, flush
    /// timeout or worker count is zero, the report frequency exceeds
    /// [`MAX_REPORT_FREQUENCY`], or an enumerated value is unknown.
    pub fn validate(self) -> Result<StageConfig, ConfigError> {
        let start_property = non_blank(self.start_property)
            .ok_or(ConfigError::MissingStartProperty)?;

        if self.report_frequency == 0 {
            return Err(ConfigError::ReportFrequencyZero);
        }
        if self.report_frequency > MAX_REPORT_FREQUENCY {
            return Err(ConfigError::ReportFrequencyTooLarge {
                value: self.report_frequency,
                max: MAX_REPORT_FREQUENCY,
            });
        }
        if self.flush_timeout_secs == 0 {
            return Err(ConfigError::FlushTimeoutZero);
        }
        if self.workers == 0 {
            return Err(ConfigError::WorkersZero);
        }

        let time_unit = match self.cloudwatch_metric_time_unit {
            Some(raw) => raw.parse()?,
            None => TimeUnit::default(),
        };
        let flush_mode = match self.cloudwatch_flush_mode {
            Some(raw) => raw.parse()?,
            None => FlushMode::default(),
        };

        Ok(StageConfig {
            name: self.cloudwatch_name.unwrap_or_else(|| DEFAULT_NAME.into()),
            namespace: self
                .cloudwatch_namespace
                .unwrap_or_else(|| DEFAULT_NAMESPACE.into()),
            region: self
                .cloudwatch_region_name
                .unwrap_or_else(|| DEFAULT_REGION.into()),
            topology: self
                .topology_name
                .unwrap_or_else(|| DEFAULT_TOPOLOGY.into()),
            start_property,
            end_property: non_blank(self.end_property),
            report_interval: minutes(self.report_frequency),
            time_unit,
            flush_mode,
            flush_timeout: Duration::from_secs(self.flush_timeout_secs),
            workers: self.workers,
            status_listen: self.status_listen,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(60))
}

// ─── Time unit ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    #[default]
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// Converts a millisecond duration into this unit.
    /// Coarser units truncate toward zero, finer units saturate.
    pub const fn from_millis(self, millis: i64) -> i64 {
        match self {
            Self::Nanoseconds => millis.saturating_mul(1_000_000),
            Self::Microseconds => millis.saturating_mul(1_000),
            Self::Milliseconds => millis,
            Self::Seconds => millis / 1_000,
            Self::Minutes => millis / 60_000,
            Self::Hours => millis / 3_600_000,
            Self::Days => millis / 86_400_000,
        }
    }

    /// Unit label understood by the metrics backend.
    pub const fn backend_unit(self) -> &'static str {
        match self {
            Self::Microseconds => "Microseconds",
            Self::Milliseconds => "Milliseconds",
            Self::Seconds => "Seconds",
            Self::Nanoseconds | Self::Minutes | Self::Hours | Self::Days => "None",
        }
    }
}

impl FromStr for TimeUnit {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NANOSECONDS" => Ok(Self::Nanoseconds),
            "MICROSECONDS" => Ok(Self::Microseconds),
            "MILLISECONDS" => Ok(Self::Milliseconds),
            "SECONDS" => Ok(Self::Seconds),
            "MINUTES" => Ok(Self::Minutes),
            "HOURS" => Ok(Self::Hours),
            "DAYS" => Ok(Self::Days),
            _ => Err(ConfigError::InvalidTimeUnit {
                value: s.to_owned(),
            }),
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Nanoseconds => "nanoseconds",
            Self::Microseconds => "microseconds",
            Self::Milliseconds => "milliseconds",
            Self::Seconds => "seconds",
            Self::Minutes => "minutes",
            Self::Hours => "hours",
            Self::Days => "days",
        };
        f.write_str(label)
    }
}

// ─── Flush mode ──────────────────────────────────────────────────

/// Whether each flush reads the aggregate or drains it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlushMode {
    #[default]
    Cumulative,
    Delta,
}

impl FromStr for FlushMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cumulative" => Ok(Self::Cumulative),
            "delta" => Ok(Self::Delta),
            _ => Err(ConfigError::InvalidFlushMode {
                value: s.to_owned(),
            }),
        }
    }
}

// ─── Loader ──────────────────────────────────────────────────────

/// Reads a `.toml` or `.json` settings file.
///
/// # Errors
///
/// Returns an error when the file cannot be read or parsed.
pub fn load_settings(path: &Path) -> Result<StageSettings, ConfigError> {
    let content =
        std::fs::read_to_string(path).map_err(|source| ConfigError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => {
            toml::from_str(&content).map_err(|source| ConfigError::ParseToml {
                path: path.to_path_buf(),
                source,
            })
        }
        Some("json") => {
            serde_json::from_str(&content).map_err(|source| ConfigError::ParseJson {
                path: path.to_path_buf(),
                source,
            })
        }
        Some(ext) => Err(ConfigError::UnsupportedExtension {
            ext: ext.to_owned(),
        }),
        None => Err(ConfigError::MissingExtension),
    }
}
