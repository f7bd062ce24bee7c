//! Connector trait definitions for cloudits.
//!
//! Every provider that cloudits pulls evidence from implements [`Connector`],
//! and every SaaS platform additionally implements [`EvidenceSource`], which
//! exposes a fixed set of named collectors.

use crate::secure_string::SecureString;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur in connectors.
#[derive(Error, Debug, Clone)]
pub enum ConnectorError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Rate limited: retry after {0} seconds")]
    RateLimited(u64),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Health status of a connector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorHealth {
    /// Connector is healthy and operational.
    Healthy,
    /// Connector answered but something looks off.
    Degraded(String),
    /// Connector is unhealthy and not operational.
    Unhealthy(String),
    /// Health status is unknown.
    Unknown,
}

/// Configuration shared by every HTTP based connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Connector name/identifier.
    pub name: String,
    /// Base URL for the API.
    pub base_url: String,
    /// Authentication configuration.
    pub auth: AuthConfig,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum retries.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Whether to verify TLS certificates.
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
    /// Additional headers to include.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_verify_tls() -> bool {
    true
}

/// Authentication configuration.
///
/// All credential fields use `SecureString` so they are zeroized from memory
/// once the connector is dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    /// No authentication.
    None,
    /// API key sent in a dedicated header (JumpCloud `x-api-key`).
    ApiKey {
        key: SecureString,
        header_name: String,
    },
    /// Bearer token authentication.
    BearerToken { token: SecureString },
    /// Basic authentication (Jira email + API token).
    Basic {
        username: String,
        password: SecureString,
    },
    /// `Authorization: <scheme> <token>` with a vendor specific scheme,
    /// e.g. `SSWS` for Okta, `APIToken` for SentinelOne, `ApiKey` for Elastic.
    Scheme { scheme: String, token: SecureString },
}

/// Placeholder shown instead of a secret.
pub const REDACTED: &str = "***REDACTED***";

impl AuthConfig {
    /// Replaces every non-empty secret with [`REDACTED`].
    pub fn redact(&mut self) {
        let secret = match self {
            AuthConfig::None => return,
            AuthConfig::ApiKey { key, .. } => key,
            AuthConfig::BearerToken { token } => token,
            AuthConfig::Basic { password, .. } => password,
            AuthConfig::Scheme { token, .. } => token,
        };
        if !secret.is_empty() {
            *secret = SecureString::from(REDACTED);
        }
    }

    /// Returns true when the variant carries no usable secret.
    pub fn is_missing_secret(&self) -> bool {
        match self {
            AuthConfig::None => false,
            AuthConfig::ApiKey { key, .. } => key.is_empty(),
            AuthConfig::BearerToken { token } => token.is_empty(),
            AuthConfig::Basic { username, password } => username.is_empty() || password.is_empty(),
            AuthConfig::Scheme { token, .. } => token.is_empty(),
        }
    }
}

/// Platform a connector talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Aws,
    Okta,
    JumpCloud,
    SentinelOne,
    Elastic,
    GitHub,
    Jira,
}

impl Platform {
    /// All SaaS platforms, in the order `collect source all` runs them.
    pub const SAAS: [Platform; 6] = [
        Platform::Okta,
        Platform::JumpCloud,
        Platform::SentinelOne,
        Platform::Elastic,
        Platform::GitHub,
        Platform::Jira,
    ];

    /// Evidence category the platform's artifacts are filed under.
    pub fn category(&self) -> ConnectorCategory {
        match self {
            Platform::Aws => ConnectorCategory::Cloud,
            Platform::Okta | Platform::JumpCloud => ConnectorCategory::Identity,
            Platform::SentinelOne => ConnectorCategory::Edr,
            Platform::Elastic => ConnectorCategory::Siem,
            Platform::GitHub => ConnectorCategory::SourceControl,
            Platform::Jira => ConnectorCategory::Ticketing,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Platform::Aws => "aws",
            Platform::Okta => "okta",
            Platform::JumpCloud => "jumpcloud",
            Platform::SentinelOne => "sentinelone",
            Platform::Elastic => "elastic",
            Platform::GitHub => "github",
            Platform::Jira => "jira",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Platform {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(Platform::Aws),
            "okta" => Ok(Platform::Okta),
            "jumpcloud" => Ok(Platform::JumpCloud),
            "sentinelone" | "sentinel1" | "s1" => Ok(Platform::SentinelOne),
            "elastic" | "elasticsearch" => Ok(Platform::Elastic),
            "github" => Ok(Platform::GitHub),
            "jira" => Ok(Platform::Jira),
            other => Err(ConnectorError::ConfigError(format!(
                "Unknown platform: {}",
                other
            ))),
        }
    }
}

/// Category of a connector; the first path segment of SaaS artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorCategory {
    Cloud,
    Identity,
    Edr,
    Siem,
    SourceControl,
    Ticketing,
}

impl fmt::Display for ConnectorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cloud => "cloud",
            Self::Identity => "identity_and_access",
            Self::Edr => "endpoint_security",
            Self::Siem => "logging_and_monitoring",
            Self::SourceControl => "change_management",
            Self::Ticketing => "ticketing",
        };
        write!(f, "{}", s)
    }
}

/// Base trait for all connectors.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Returns the connector name.
    fn name(&self) -> &str;

    /// Returns the platform this connector talks to.
    fn platform(&self) -> Platform;

    /// Returns the connector category.
    fn category(&self) -> ConnectorCategory {
        self.platform().category()
    }

    /// Checks the health of the connector.
    async fn health_check(&self) -> ConnectorResult<ConnectorHealth>;

    /// Tests the connection to the external system.
    async fn test_connection(&self) -> ConnectorResult<bool>;
}

/// Time window a collector looks back over.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionWindow {
    /// Start time.
    pub start: DateTime<Utc>,
    /// End time.
    pub end: DateTime<Utc>,
}

impl CollectionWindow {
    /// Creates a window covering the last N days.
    pub fn last_days(days: i64) -> Self {
        Self::ending_at(Utc::now(), days)
    }

    /// Creates a window of N days ending at `end`.
    pub fn ending_at(end: DateTime<Utc>, days: i64) -> Self {
        Self {
            start: end - chrono::Duration::days(days),
            end,
        }
    }

    /// Returns true if `at` falls within the window (inclusive).
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }

    /// Parses an RFC 3339 timestamp and checks it against the window.
    pub fn contains_rfc3339(&self, value: &str) -> bool {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| self.contains(dt.with_timezone(&Utc)))
            .unwrap_or(false)
    }
}

/// One unit of evidence produced by a collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    /// File stem for the artifact (e.g. `mfa_enrollments`, `web-app-pull-requests`).
    pub subject: String,
    /// Raw evidence payload.
    pub payload: serde_json::Value,
    /// When set, the payload (an array of objects) is also written as CSV
    /// with these columns. An empty list means "use every key seen".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csv_columns: Option<Vec<String>>,
    /// Rows for the CSV rendition when they differ from `payload`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csv_rows: Option<Vec<serde_json::Value>>,
}

impl EvidenceItem {
    /// Creates a JSON-only evidence item.
    pub fn json(subject: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            subject: subject.into(),
            payload,
            csv_columns: None,
            csv_rows: None,
        }
    }

    /// Creates an evidence item that is also rendered as CSV.
    pub fn tabular(
        subject: impl Into<String>,
        payload: serde_json::Value,
        columns: &[&str],
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            csv_columns: Some(columns.iter().map(|c| c.to_string()).collect()),
            csv_rows: None,
        }
    }

    /// Replaces the rows used for the CSV rendition.
    pub fn with_csv_rows(mut self, rows: Vec<serde_json::Value>) -> Self {
        self.csv_rows = Some(rows);
        self
    }
}

/// A SaaS platform that exposes named evidence collectors.
#[async_trait]
pub trait EvidenceSource: Connector {
    /// Names of the collectors this source supports.
    fn collectors(&self) -> Vec<&'static str>;

    /// Runs a single collector.
    ///
    /// Returns `InvalidRequest` for collector names not listed by
    /// [`EvidenceSource::collectors`].
    async fn collect(
        &self,
        collector: &str,
        window: &CollectionWindow,
    ) -> ConnectorResult<Vec<EvidenceItem>>;
}

/// Builds the error returned for an unsupported collector name.
pub(crate) fn unknown_collector(platform: Platform, collector: &str) -> ConnectorError {
    ConnectorError::InvalidRequest(format!(
        "{} has no collector named '{}'",
        platform, collector
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_window_last_days() {
        let window = CollectionWindow::last_days(30);
        assert_eq!((window.end - window.start).num_days(), 30);
    }

    #[test]
    fn test_window_contains_rfc3339() {
        let end = Utc.with_ymd_and_hms(2024, 3, 31, 12, 0, 0).unwrap();
        let window = CollectionWindow::ending_at(end, 31);
        assert!(window.contains_rfc3339("2024-03-15T08:00:00Z"));
        assert!(!window.contains_rfc3339("2024-01-01T00:00:00Z"));
        assert!(!window.contains_rfc3339("not a date"));
    }

    #[test]
    fn test_platform_round_trip_names() {
        for platform in Platform::SAAS {
            let parsed: Platform = platform.to_string().parse().unwrap();
            assert_eq!(parsed, platform);
        }
        assert_eq!("sentinel1".parse::<Platform>().unwrap(), Platform::SentinelOne);
        assert!("splunk".parse::<Platform>().is_err());
    }

    #[test]
    fn test_platform_categories() {
        assert_eq!(Platform::Okta.category(), ConnectorCategory::Identity);
        assert_eq!(Platform::Jira.category().to_string(), "ticketing");
        assert_eq!(
            Platform::JumpCloud.category().to_string(),
            "identity_and_access"
        );
    }

    #[test]
    fn test_missing_secret_detection() {
        let auth = AuthConfig::Scheme {
            scheme: "SSWS".into(),
            token: SecureString::default(),
        };
        assert!(auth.is_missing_secret());

        let auth = AuthConfig::Basic {
            username: "auditor@example.com".into(),
            password: "token".into(),
        };
        assert!(!auth.is_missing_secret());
        assert!(!AuthConfig::None.is_missing_secret());
    }

    #[test]
    fn test_redact_auth() {
        let mut auth = AuthConfig::Basic {
            username: "auditor@example.com".into(),
            password: "token".into(),
        };
        auth.redact();
        match auth {
            AuthConfig::Basic { username, password } => {
                assert_eq!(username, "auditor@example.com");
                assert_eq!(password.expose_secret(), REDACTED);
            }
            other => panic!("unexpected auth: {:?}", other),
        }

        let mut empty = AuthConfig::BearerToken {
            token: SecureString::default(),
        };
        empty.redact();
        assert!(empty.is_missing_secret());
    }

    #[test]
    fn test_auth_config_deserialize_scheme() {
        let json = r#"{"type":"scheme","scheme":"APIToken","token":"abc"}"#;
        let auth: AuthConfig = serde_json::from_str(json).unwrap();
        match auth {
            AuthConfig::Scheme { scheme, token } => {
                assert_eq!(scheme, "APIToken");
                assert_eq!(token.expose_secret(), "abc");
            }
            other => panic!("unexpected auth: {:?}", other),
        }
    }

    #[test]
    fn test_evidence_item_constructors() {
        let item = EvidenceItem::tabular("users", serde_json::json!([]), &["id", "email"]);
        assert_eq!(item.csv_columns.as_deref().map(|c| c.len()), Some(2));
        assert!(EvidenceItem::json("x", serde_json::json!({})).csv_columns.is_none());
    }
}
