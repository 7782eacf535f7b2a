//! Tracing subscriber setup.
//!
//! Human-readable events go to stderr so stdout stays free for command
//! output. When a log directory is given, every event is also appended as
//! JSON to `adw.log` through a non-blocking writer.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

pub const LOG_FILE: &str = "adw.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive, e.g. `adw=debug,git2=warn`
    pub directive: String,
    pub format: LogFormat,
    pub ansi: bool,
    pub file_dir: Option<PathBuf>,
}

impl LogConfig {
    pub fn from_env(verbose: bool) -> Self {
        Self::from_lookup(verbose, |name| std::env::var(name).ok())
    }

    /// `ADW_LOG` beats `RUST_LOG`; `ADW_LOG_FORMAT=json` switches stderr
    /// output to JSON lines.
    pub fn from_lookup(verbose: bool, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = if verbose { "adw=debug" } else { "adw=info" };
        let directive = lookup("ADW_LOG")
            .or_else(|| lookup("RUST_LOG"))
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| default.to_string());
        let format = match lookup("ADW_LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        };
        Self {
            directive,
            format,
            ansi: console::colors_enabled_stderr(),
            file_dir: None,
        }
    }

    pub fn with_file_dir(mut self, dir: &Path) -> Self {
        self.file_dir = Some(dir.to_path_buf());
        self
    }

    fn filter(&self) -> Result<EnvFilter> {
        EnvFilter::try_new(&self.directive)
            .with_context(|| format!("Invalid log filter '{}'", self.directive))
    }
}

/// Flushes the file writer when dropped. Hold it until exit.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(config: &LogConfig) -> Result<LogGuard> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(config.ansi);
    match config.format {
        LogFormat::Json => layers.push(stderr.json().with_filter(config.filter()?).boxed()),
        LogFormat::Compact => layers.push(stderr.compact().with_filter(config.filter()?).boxed()),
    }

    let mut file_guard = None;
    if let Some(dir) = &config.file_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, LOG_FILE));
        layers.push(
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(config.filter()?)
                .boxed(),
        );
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(LogGuard { _file: file_guard })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = LogConfig::from_lookup(false, lookup(&[]));
        assert_eq!(config.directive, "adw=info");
        assert_eq!(config.format, LogFormat::Compact);
        assert_eq!(LogConfig::from_lookup(true, lookup(&[])).directive, "adw=debug");
    }

    #[test]
    fn test_adw_log_beats_rust_log() {
        let config = LogConfig::from_lookup(
            false,
            lookup(&[("RUST_LOG", "warn"), ("ADW_LOG", "adw=trace"), ("ADW_LOG_FORMAT", "json")]),
        );
        assert_eq!(config.directive, "adw=trace");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(LogConfig::from_lookup(false, lookup(&[("RUST_LOG", "warn")])).directive, "warn");
    }

    #[test]
    fn test_invalid_directive_is_reported() {
        let config = LogConfig::from_lookup(false, lookup(&[("ADW_LOG", "adw=loud")]));
        assert!(config.filter().is_err());
    }
}
