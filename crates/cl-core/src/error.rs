//! Core error types.

use cl_connectors::ConnectorError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the collection engine.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A provider call or credential lookup failed.
    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),

    /// A path template referenced an unknown placeholder or produced an
    /// unusable path.
    #[error("Path template error: {0}")]
    PathTemplate(String),

    /// Reading or writing an artifact failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The framework mapping could not be loaded.
    #[error("Mapping error: {0}")]
    Mapping(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CoreError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

impl From<csv::Error> for CoreError {
    fn from(err: csv::Error) -> Self {
        CoreError::Serialization(format!("CSV: {}", err))
    }
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_display() {
        let err = CoreError::PathTemplate("unknown placeholder {zone}".to_string());
        assert!(err.to_string().contains("{zone}"));

        let err = CoreError::io(
            "/tmp/evidence.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/tmp/evidence.json"));
    }

    #[test]
    fn test_connector_error_converts() {
        let err: CoreError = ConnectorError::AuthorizationDenied("sts".into()).into();
        assert!(matches!(err, CoreError::Connector(_)));
        assert!(err.to_string().contains("sts"));
    }
}
