//! Logging infrastructure for cloudits.
//!
//! Structured logging with the tracing ecosystem: one console layer (text or
//! JSON) plus an optional plain-text log file that is truncated at the start
//! of every run.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Crates covered by the default filter.
const CRATES: &[&str] = &["cl_core", "cl_connectors", "cl_observability", "cloudits"];

/// Errors raised while installing the subscriber.
#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level.
    pub level: Level,
    /// Whether to use JSON format on the console.
    pub json_format: bool,
    /// Whether to include span events.
    pub include_spans: bool,
    /// Whether to include file/line info.
    pub include_location: bool,
    /// Whether to include thread IDs.
    pub include_thread_ids: bool,
    /// Whether to include target (module path).
    pub include_target: bool,
    /// Optional log file mirrored from the console output.
    pub log_file: Option<PathBuf>,
    /// Writes console output to stderr, keeping stdout for machine-readable reports.
    pub console_stderr: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            include_spans: false,
            include_location: false,
            include_thread_ids: false,
            include_target: true,
            log_file: None,
            console_stderr: false,
        }
    }
}

impl LoggingConfig {
    /// Creates a development configuration with more verbose output.
    pub fn development() -> Self {
        Self {
            level: Level::DEBUG,
            json_format: false,
            include_spans: true,
            include_location: true,
            include_thread_ids: true,
            include_target: true,
            log_file: None,
            console_stderr: false,
        }
    }

    /// Creates a production configuration with JSON output.
    pub fn production() -> Self {
        Self {
            level: Level::INFO,
            json_format: true,
            include_spans: false,
            include_location: false,
            include_thread_ids: false,
            include_target: true,
            log_file: None,
            console_stderr: false,
        }
    }

    /// Sends console output to stderr.
    pub fn with_console_stderr(mut self, stderr: bool) -> Self {
        self.console_stderr = stderr;
        self
    }

    /// Mirrors output to a log file.
    pub fn with_log_file(mut self, path: impl AsRef<Path>) -> Self {
        self.log_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Default `EnvFilter` directive: every cloudits crate at the configured level.
    pub fn filter_directive(&self) -> String {
        CRATES
            .iter()
            .map(|krate| format!("{}={}", krate, self.level))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Initializes the logging system with default configuration.
pub fn init_logging() -> Result<(), LoggingError> {
    init_logging_with_config(LoggingConfig::default())
}

/// Initializes the logging system with the given configuration.
///
/// `RUST_LOG` overrides the level filter when set.
pub fn init_logging_with_config(config: LoggingConfig) -> Result<(), LoggingError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let span_events = if config.include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let console_layer = fmt::layer()
        .with_span_events(span_events.clone())
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_thread_ids(config.include_thread_ids)
        .with_target(config.include_target);
    let console_layer = match (config.json_format, config.console_stderr) {
        (true, true) => console_layer.json().with_writer(std::io::stderr).boxed(),
        (true, false) => console_layer.json().boxed(),
        (false, true) => console_layer.with_writer(std::io::stderr).boxed(),
        (false, false) => console_layer.boxed(),
    };

    let file_layer = match &config.log_file {
        Some(path) => {
            let file = open_log_file(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_span_events(span_events)
                    .with_target(config.include_target)
                    .with_writer(Mutex::new(file))
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .with(env_filter)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}

/// Creates (or truncates) the log file, creating parent directories.
fn open_log_file(path: &Path) -> Result<File, LoggingError> {
    let to_error = |source| LoggingError::LogFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(to_error)?;
    }
    File::create(path).map_err(to_error)
}

/// Creates a span for one AWS collection unit.
#[macro_export]
macro_rules! collection_span {
    ($environment:expr, $role:expr, $region:expr) => {
        tracing::info_span!(
            "collection",
            environment = %$environment,
            role = %$role,
            region = %$region
        )
    };
}

/// Creates a span for one SaaS collector run.
#[macro_export]
macro_rules! source_span {
    ($platform:expr, $collector:expr) => {
        tracing::info_span!("source", platform = %$platform, collector = %$collector)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(!config.json_format);
        assert!(config.log_file.is_none());
        assert!(!config.console_stderr);
        assert!(LoggingConfig::production().with_console_stderr(true).console_stderr);
    }

    #[test]
    fn test_production_config() {
        let config = LoggingConfig::production();
        assert_eq!(config.level, Level::INFO);
        assert!(config.json_format);
    }

    #[test]
    fn test_development_config() {
        let config = LoggingConfig::development();
        assert_eq!(config.level, Level::DEBUG);
        assert!(config.include_spans);
    }

    #[test]
    fn test_filter_directive_covers_crates() {
        let directive = LoggingConfig::development().filter_directive();
        assert!(directive.contains("cl_core=DEBUG"));
        assert!(directive.contains("cl_connectors=DEBUG"));
    }

    #[test]
    fn test_open_log_file_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/cloudits.log");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "previous run").unwrap();

        open_log_file(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_spans_build() {
        let _collection = collection_span!("commercial", "audit", "us-east-1");
        let _source = source_span!("okta", "mfa_enrollments");
    }
}
