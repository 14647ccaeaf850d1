//! Settings schema definitions.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root settings structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Location of the managed configuration, e.g. `consul://127.0.0.1:8500/app/config`.
    #[serde(default)]
    pub url: Option<String>,

    /// Per-call timeout in seconds. Overrides the location's `timeout`.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Polling period in seconds. Overrides the location's `ttl`.
    #[serde(default)]
    pub reload_delay_secs: Option<u64>,

    /// Whether backends keep watching. Overrides the location's `watch`.
    #[serde(default)]
    pub watch: Option<bool>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Settings {
    /// Per-call timeout, when set.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Polling period, when set.
    pub fn reload_delay(&self) -> Option<Duration> {
        self.reload_delay_secs.map(Duration::from_secs)
    }
}

/// Log verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Returns the level as used in filter directives.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Converts to a `tracing` level.
    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    /// Requires the `json-log` feature; falls back to `Full` otherwise.
    Json,
}

/// Log destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Global level.
    #[serde(default)]
    pub level: LogLevel,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Output destination.
    #[serde(default)]
    pub output: LogOutput,

    /// Log file when `output` is `file`.
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    /// Annotate every line with its source file and line.
    #[serde(default = "default_file_location")]
    pub file_location: bool,

    /// Include thread ids.
    #[serde(default)]
    pub thread_ids: bool,

    /// Per-module levels, e.g. `kvconf_runtime = "debug"`.
    #[serde(default)]
    pub filters: HashMap<String, LogLevel>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
            output: LogOutput::default(),
            file_path: None,
            file_location: default_file_location(),
            thread_ids: false,
            filters: HashMap::new(),
        }
    }
}

fn default_file_location() -> bool {
    true
}
