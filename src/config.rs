//! Runtime configuration.
//!
//! Loaded from a TOML file. The logging file/rotation keys are validated and
//! exposed for the external asynchronous log writer; the framework itself
//! consumes `io_threads`, `buffer_size`, and `log_level`.

use serde::Deserialize;
use std::path::Path;

use crate::error::Error;

/// Framework configuration loaded from a TOML file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Number of worker threads in the IO pool (default: number of CPUs).
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,

    /// Initial per-connection buffer capacity in bytes.
    #[serde(default = "default_buffer_size", deserialize_with = "deserialize_size")]
    pub buffer_size: usize,

    /// Log level: "DEBUG", "INFO", or "ERROR"; anything else maps to UNKNOWN.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Base name for log files, consumed by the async log writer.
    #[serde(default = "default_log_file_name")]
    pub log_file_name: String,

    /// Directory for log files, consumed by the async log writer.
    #[serde(default = "default_log_file_path")]
    pub log_file_path: String,

    /// Rollover threshold per log file (e.g. "64MB").
    #[serde(
        default = "default_log_max_file_size",
        deserialize_with = "deserialize_size"
    )]
    pub log_max_file_size: usize,

    /// Interval in milliseconds between log buffer syncs.
    #[serde(default = "default_log_sync_interval")]
    pub log_sync_interval: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            io_threads: default_io_threads(),
            buffer_size: default_buffer_size(),
            log_level: LogLevel::default(),
            log_file_name: default_log_file_name(),
            log_file_path: default_log_file_path(),
            log_max_file_size: default_log_max_file_size(),
            log_sync_interval: default_log_sync_interval(),
        }
    }
}

/// Log level selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Error,
    Unknown,
}

impl LogLevel {
    /// Filter directive for the tracing subscriber. UNKNOWN falls back to
    /// "info" so a typo never silences the logs entirely.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Error => "error",
            LogLevel::Unknown => "info",
        }
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(match s.to_uppercase().as_str() {
            "DEBUG" => LogLevel::Debug,
            "INFO" => LogLevel::Info,
            "ERROR" => LogLevel::Error,
            _ => LogLevel::Unknown,
        })
    }
}

// Default value functions

fn default_io_threads() -> usize {
    num_cpus::get()
}

fn default_buffer_size() -> usize {
    128
}

fn default_log_file_name() -> String {
    "girder".to_string()
}

fn default_log_file_path() -> String {
    ".".to_string()
}

fn default_log_max_file_size() -> usize {
    64 * 1024 * 1024
}

fn default_log_sync_interval() -> u64 {
    500
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        let config: Config =
            toml::from_str(&contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Error> {
        if self.io_threads == 0 {
            return Err(Error::Config("io_threads must be at least 1".to_string()));
        }
        if self.buffer_size == 0 {
            return Err(Error::Config("buffer_size must be at least 1".to_string()));
        }
        if self.log_max_file_size == 0 {
            return Err(Error::Config(
                "log_max_file_size must be non-zero".to_string(),
            ));
        }
        if self.log_file_name.is_empty() {
            return Err(Error::Config("log_file_name must be non-empty".to_string()));
        }
        Ok(())
    }
}

/// Deserialize a size given either as a number or a string like "64MB".
fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(usize),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(D::Error::custom),
    }
}

/// Parse a size string like "64MB" or "4GB" into bytes.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_alphabetic()) {
        Some(idx) => (&s[..idx], s[idx..].to_uppercase()),
        None => (s, String::new()),
    };

    let num: usize = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {num_str}"))?;

    let multiplier: usize = match suffix.as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        _ => return Err(format!("unknown size suffix: {suffix}")),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| "size overflow".to_string())
}
