//! AWS credential sources and role assumption.
//!
//! Every environment (commercial, federal, ...) owns an access-key pair read
//! from environment variables. Those base credentials are used to assume the
//! per-purpose audit roles through STS.

use crate::secure_string::SecureString;
use crate::traits::{ConnectorError, ConnectorResult};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::Credentials;
use aws_sdk_sts::error::DisplayErrorContext;
use aws_sdk_sts::Client as StsClient;
use chrono::{DateTime, Utc};
use std::time::SystemTime;
use tracing::{debug, info, instrument, warn};

/// A set of AWS credentials, possibly temporary.
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: SecureString,
    pub session_token: Option<SecureString>,
    pub expiration: Option<DateTime<Utc>>,
}

impl AwsCredentials {
    /// Creates long-lived credentials.
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<SecureString>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            expiration: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<SecureString>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Returns true once the credentials have expired.
    pub fn is_expired(&self) -> bool {
        self.expiration.map(|exp| exp <= Utc::now()).unwrap_or(false)
    }
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("session_token", &self.session_token.as_ref().map(|_| "[REDACTED]"))
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

/// Supplies base credentials and assumes roles with them.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Credentials of the automation user itself.
    async fn base_credentials(&self) -> ConnectorResult<AwsCredentials>;

    /// Assumes a role and returns its temporary credentials.
    async fn assume_role(&self, role_arn: &str, session_name: &str)
        -> ConnectorResult<AwsCredentials>;
}

/// Where an environment's access keys come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentCredentialSource {
    pub environment: String,
    pub access_key_var: String,
    pub secret_key_var: String,
    pub default_region: String,
}

impl EnvironmentCredentialSource {
    /// Builds a source from a variable prefix, e.g. `FEDERAL_AUTOMATION_`
    /// reads `FEDERAL_AUTOMATION_AWS_ACCESS_KEY_ID`.
    pub fn with_prefix(environment: &str, prefix: &str, default_region: &str) -> Self {
        Self {
            environment: environment.to_string(),
            access_key_var: format!("{}AWS_ACCESS_KEY_ID", prefix),
            secret_key_var: format!("{}AWS_SECRET_ACCESS_KEY", prefix),
            default_region: default_region.to_string(),
        }
    }

    /// The two built-in environments.
    pub fn for_environment(environment: &str) -> ConnectorResult<Self> {
        match environment {
            "commercial" => Ok(Self::with_prefix(environment, "AUTOMATION_", "us-east-1")),
            "federal" => Ok(Self::with_prefix(
                environment,
                "FEDERAL_AUTOMATION_",
                "us-west-2",
            )),
            other => Err(ConnectorError::ConfigError(format!(
                "Invalid environment '{}' specified",
                other
            ))),
        }
    }

    /// Reads the key pair; `None` when either variable is missing.
    pub fn read(&self) -> Option<AwsCredentials> {
        let access_key = std::env::var(&self.access_key_var)
            .ok()
            .filter(|v| !v.is_empty())?;
        let secret = SecureString::from_env(&self.secret_key_var)?;
        Some(AwsCredentials::new(access_key, secret))
    }
}

/// Assumes roles through AWS STS.
pub struct StsCredentialProvider {
    source: EnvironmentCredentialSource,
    sdk_config: SdkConfig,
    static_credentials: Option<AwsCredentials>,
}

impl StsCredentialProvider {
    /// Loads an SDK config for the environment.
    ///
    /// When the environment's key variables are unset the default AWS
    /// provider chain is used instead.
    pub async fn new(source: EnvironmentCredentialSource) -> Self {
        let static_credentials = source.read();
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(source.default_region.clone()));

        match &static_credentials {
            Some(creds) => {
                loader = loader.credentials_provider(Credentials::new(
                    creds.access_key_id.clone(),
                    creds.secret_access_key.expose_secret().to_string(),
                    None,
                    None,
                    "cloudits-environment",
                ));
            }
            None => warn!(
                environment = %source.environment,
                "Environment key variables unset, falling back to default AWS credential chain"
            ),
        }

        let sdk_config = loader.load().await;
        info!(environment = %source.environment, region = %source.default_region, "Initialized STS credential provider");

        Self {
            source,
            sdk_config,
            static_credentials,
        }
    }

    pub fn source(&self) -> &EnvironmentCredentialSource {
        &self.source
    }
}

#[async_trait]
impl CredentialProvider for StsCredentialProvider {
    async fn base_credentials(&self) -> ConnectorResult<AwsCredentials> {
        if let Some(creds) = &self.static_credentials {
            return Ok(creds.clone());
        }

        let provider = self.sdk_config.credentials_provider().ok_or_else(|| {
            ConnectorError::AuthenticationFailed(format!(
                "Missing AWS credentials for the '{}' environment",
                self.source.environment
            ))
        })?;
        let creds = provider
            .provide_credentials()
            .await
            .map_err(|e| ConnectorError::AuthenticationFailed(e.to_string()))?;

        Ok(AwsCredentials {
            access_key_id: creds.access_key_id().to_string(),
            secret_access_key: SecureString::from(creds.secret_access_key()),
            session_token: creds.session_token().map(SecureString::from),
            expiration: creds.expiry().map(system_time_to_utc),
        })
    }

    #[instrument(skip(self))]
    async fn assume_role(
        &self,
        role_arn: &str,
        session_name: &str,
    ) -> ConnectorResult<AwsCredentials> {
        let sts = StsClient::new(&self.sdk_config);
        let response = sts
            .assume_role()
            .role_arn(role_arn)
            .role_session_name(session_name)
            .send()
            .await
            .map_err(|e| {
                ConnectorError::AuthorizationDenied(format!(
                    "Failed to assume role {}: {}",
                    role_arn,
                    DisplayErrorContext(e)
                ))
            })?;

        let creds = response.credentials().ok_or_else(|| {
            ConnectorError::InvalidResponse(format!("AssumeRole {} returned no credentials", role_arn))
        })?;

        debug!(role_arn, "Assumed role");
        Ok(AwsCredentials {
            access_key_id: creds.access_key_id().to_string(),
            secret_access_key: SecureString::from(creds.secret_access_key()),
            session_token: Some(SecureString::from(creds.session_token())),
            expiration: DateTime::<Utc>::from_timestamp(creds.expiration().secs(), 0),
        })
    }
}

fn system_time_to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

/// STS session name used for an audit role.
pub fn session_name(role_key: &str) -> String {
    format!("session-{}", role_key)
}

/// Extracts the account ID from an ARN (`arn:aws:iam::123456789012:role/x`).
pub fn account_id_from_arn(arn: &str) -> Option<&str> {
    let mut parts = arn.split(':');
    if parts.next() != Some("arn") {
        return None;
    }
    parts.nth(3).filter(|id| !id.is_empty())
}

/// Returns true for a syntactically valid IAM role ARN.
pub fn is_role_arn(arn: &str) -> bool {
    let parts: Vec<&str> = arn.splitn(6, ':').collect();
    parts.len() == 6
        && parts[0] == "arn"
        && parts[1].starts_with("aws")
        && parts[2] == "iam"
        && parts[4].len() == 12
        && parts[4].chars().all(|c| c.is_ascii_digit())
        && parts[5].starts_with("role/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_builtin_environments() {
        let commercial = EnvironmentCredentialSource::for_environment("commercial").unwrap();
        assert_eq!(commercial.access_key_var, "AUTOMATION_AWS_ACCESS_KEY_ID");
        assert_eq!(commercial.default_region, "us-east-1");

        let federal = EnvironmentCredentialSource::for_environment("federal").unwrap();
        assert_eq!(federal.secret_key_var, "FEDERAL_AUTOMATION_AWS_SECRET_ACCESS_KEY");
        assert_eq!(federal.default_region, "us-west-2");

        assert!(EnvironmentCredentialSource::for_environment("govcloud").is_err());
    }

    #[test]
    #[serial]
    fn test_read_requires_both_keys() {
        let source = EnvironmentCredentialSource::with_prefix("test", "CLOUDITS_TEST_", "us-east-1");
        std::env::set_var("CLOUDITS_TEST_AWS_ACCESS_KEY_ID", "AKIDEXAMPLE");
        std::env::remove_var("CLOUDITS_TEST_AWS_SECRET_ACCESS_KEY");
        assert!(source.read().is_none());

        std::env::set_var("CLOUDITS_TEST_AWS_SECRET_ACCESS_KEY", "secret");
        let creds = source.read().unwrap();
        assert_eq!(creds.access_key_id, "AKIDEXAMPLE");
        assert_eq!(creds.secret_access_key.expose_secret(), "secret");

        std::env::remove_var("CLOUDITS_TEST_AWS_ACCESS_KEY_ID");
        std::env::remove_var("CLOUDITS_TEST_AWS_SECRET_ACCESS_KEY");
    }

    #[test]
    fn test_account_id_from_arn() {
        assert_eq!(
            account_id_from_arn("arn:aws:iam::123456789012:role/audit"),
            Some("123456789012")
        );
        assert_eq!(account_id_from_arn("arn:aws:s3:::bucket"), None);
        assert_eq!(account_id_from_arn("not-an-arn"), None);
    }

    #[test]
    fn test_is_role_arn() {
        assert!(is_role_arn("arn:aws:iam::123456789012:role/audit"));
        assert!(is_role_arn("arn:aws-us-gov:iam::123456789012:role/path/audit"));
        assert!(!is_role_arn("arn:aws:iam::1234:role/audit"));
        assert!(!is_role_arn("arn:aws:iam::123456789012:user/bob"));
    }

    #[test]
    fn test_session_name_and_debug() {
        assert_eq!(session_name("security"), "session-security");
        let creds = AwsCredentials::new("AKID", "shh").with_session_token("tok");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("shh"));
        assert!(!debug.contains("tok"));
        assert!(!creds.is_expired());
    }
}
