//! Structured logging on top of `tracing`.
//!
//! Logs go to stderr by default so command output on stdout stays parseable.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error, off
    #[serde(default = "default_level")]
    pub level: String,

    /// text or json
    #[serde(default = "default_format")]
    pub format: String,

    /// stderr or file
    #[serde(default = "default_output")]
    pub output: String,

    #[serde(default = "default_file")]
    pub file: PathBuf,

    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_level() -> String {
    "warn".to_string()
}

fn default_format() -> String {
    "text".to_string()
}

fn default_output() -> String {
    "stderr".to_string()
}

fn default_file() -> PathBuf {
    PathBuf::from(".restbench/restbench.log")
}

fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
            output: default_output(),
            file: default_file(),
            color: default_color(),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config)?;
    let json = parse_format(&config.format)?;
    let to_file = parse_output(&config.output)?;
    let base = Registry::default().with(filter);

    let installed = match (json, to_file) {
        (true, true) => base
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(std::sync::Mutex::new(open_log_file(&config.file)?)),
            )
            .try_init(),
        (true, false) => base
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        (false, true) => base
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(open_log_file(&config.file)?)),
            )
            .try_init(),
        (false, false) => base
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(config.color)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    installed.map_err(|e| Error::Config(format!("Failed to install log subscriber: {e}")))
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level)
        .map_err(|e| Error::Config(format!("Invalid log level `{}`: {e}", config.level)))
}

fn parse_format(format: &str) -> Result<bool> {
    match format {
        "json" => Ok(true),
        "text" => Ok(false),
        other => Err(Error::Config(format!(
            "Invalid log format: {other} (must be 'json' or 'text')"
        ))),
    }
}

fn parse_output(output: &str) -> Result<bool> {
    match output {
        "file" => Ok(true),
        "stderr" => Ok(false),
        other => Err(Error::Config(format!(
            "Invalid log output: {other} (must be 'stderr' or 'file')"
        ))),
    }
}

fn open_log_file(path: &Path) -> Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::Config(format!("Failed to create log directory: {e}")))?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::Config(format!("Failed to open log file {}: {e}", path.display())))
}
