//! Testing harness for connector implementations.
//!
//! Provides config builders, health assertions and [`FakeAwsApi`], an
//! in-memory [`AwsApi`] that replays canned responses.

use crate::cloud::aws::{AwsApi, AwsCredentials, CredentialProvider};
use crate::traits::{AuthConfig, ConnectorConfig, ConnectorError, ConnectorHealth, ConnectorResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// Creates a test connector config with no auth and no retries.
pub fn test_connector_config(name: &str, base_url: &str) -> ConnectorConfig {
    ConnectorConfig {
        name: name.to_string(),
        base_url: base_url.to_string(),
        auth: AuthConfig::None,
        timeout_secs: 30,
        max_retries: 0,
        verify_tls: true,
        headers: HashMap::new(),
    }
}

/// Creates a test connector config using an `Authorization: <scheme> <token>` header.
pub fn test_connector_config_with_scheme(
    name: &str,
    base_url: &str,
    scheme: &str,
    token: &str,
) -> ConnectorConfig {
    ConnectorConfig {
        auth: AuthConfig::Scheme {
            scheme: scheme.to_string(),
            token: crate::SecureString::new(token.to_string()),
        },
        ..test_connector_config(name, base_url)
    }
}

/// Asserts that a connector health check returns healthy.
pub fn assert_healthy(result: &ConnectorResult<ConnectorHealth>) {
    match result {
        Ok(ConnectorHealth::Healthy) => {}
        other => panic!("Expected Healthy, got {:?}", other),
    }
}

/// Asserts that a connector health check returns unhealthy.
pub fn assert_unhealthy(result: &ConnectorResult<ConnectorHealth>) {
    match result {
        Ok(ConnectorHealth::Unhealthy(_)) => {}
        other => panic!("Expected Unhealthy, got {:?}", other),
    }
}

/// A recorded call made against [`FakeAwsApi`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub service: String,
    pub operation: String,
    pub region: String,
    pub params: Value,
}

/// In-memory AWS API double.
///
/// Responses are keyed by `service/operation`; a response registered with
/// [`FakeAwsApi::fail`] returns an error instead. Unregistered operations
/// return `NotFound`.
#[derive(Default)]
pub struct FakeAwsApi {
    responses: Mutex<HashMap<String, Result<Value, ConnectorError>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeAwsApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a response for an operation.
    pub fn respond(self, service: &str, operation: &str, response: Value) -> Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses.insert(format!("{}/{}", service, operation), Ok(response));
        }
        self
    }

    /// Registers an error for an operation.
    pub fn fail(self, service: &str, operation: &str, error: ConnectorError) -> Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses.insert(format!("{}/{}", service, operation), Err(error));
        }
        self
    }

    /// Returns every call made so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Returns the calls made to one operation.
    pub fn calls_to(&self, service: &str, operation: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.service == service && c.operation == operation)
            .collect()
    }
}

#[async_trait]
impl AwsApi for FakeAwsApi {
    async fn call(
        &self,
        service: &str,
        operation: &str,
        region: &str,
        params: &Value,
    ) -> ConnectorResult<Value> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                service: service.to_string(),
                operation: operation.to_string(),
                region: region.to_string(),
                params: params.clone(),
            });
        }
        let key = format!("{}/{}", service, operation);
        let responses = self
            .responses
            .lock()
            .map_err(|_| ConnectorError::Internal("fake api poisoned".into()))?;
        match responses.get(&key) {
            Some(result) => result.clone(),
            None => Err(ConnectorError::NotFound(key)),
        }
    }
}

/// Credential provider that hands out fixed keys and can deny chosen roles.
#[derive(Default)]
pub struct FakeCredentialProvider {
    denied: Vec<String>,
    assumed: Mutex<Vec<String>>,
}

impl FakeCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `assume_role` fail for the given role ARN.
    pub fn deny(mut self, role_arn: &str) -> Self {
        self.denied.push(role_arn.to_string());
        self
    }

    /// Role ARNs assumed so far.
    pub fn assumed(&self) -> Vec<String> {
        self.assumed.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CredentialProvider for FakeCredentialProvider {
    async fn base_credentials(&self) -> ConnectorResult<AwsCredentials> {
        Ok(AwsCredentials::new("AKIDEXAMPLE", "base-secret"))
    }

    async fn assume_role(&self, role_arn: &str, session_name: &str) -> ConnectorResult<AwsCredentials> {
        if self.denied.iter().any(|r| r == role_arn) {
            return Err(ConnectorError::AuthorizationDenied(format!(
                "not authorized to assume {}",
                role_arn
            )));
        }
        if let Ok(mut assumed) = self.assumed.lock() {
            assumed.push(role_arn.to_string());
        }
        Ok(AwsCredentials::new("ASIAEXAMPLE", "assumed-secret").with_session_token(session_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_test_connector_config() {
        let config = test_connector_config("test", "https://api.example.com");
        assert_eq!(config.name, "test");
        assert_eq!(config.max_retries, 0);
        assert!(matches!(config.auth, AuthConfig::None));
    }

    #[test]
    fn test_config_with_scheme() {
        let config = test_connector_config_with_scheme("okta", "https://x", "SSWS", "t");
        assert!(matches!(config.auth, AuthConfig::Scheme { ref scheme, .. } if scheme == "SSWS"));
    }

    #[test]
    fn test_assert_helpers() {
        assert_healthy(&Ok(ConnectorHealth::Healthy));
        assert_unhealthy(&Ok(ConnectorHealth::Unhealthy("down".to_string())));
    }

    #[tokio::test]
    async fn test_fake_api_records_calls() {
        let api = FakeAwsApi::new().respond("sqs", "list_queues", json!({"QueueUrls": ["q"]}));
        let out = api
            .call("sqs", "list_queues", "us-east-1", &json!({}))
            .await
            .unwrap();
        assert_eq!(out["QueueUrls"][0], "q");
        assert!(api
            .call("sqs", "get_queue_attributes", "us-east-1", &json!({}))
            .await
            .is_err());
        assert_eq!(api.calls().len(), 2);
        assert_eq!(api.calls_to("sqs", "list_queues")[0].region, "us-east-1");
    }

    #[tokio::test]
    async fn test_fake_credentials_deny() {
        let provider = FakeCredentialProvider::new().deny("arn:aws:iam::1:role/blocked");
        assert!(provider
            .assume_role("arn:aws:iam::1:role/blocked", "session-blocked")
            .await
            .is_err());
        let creds = provider
            .assume_role("arn:aws:iam::1:role/audit", "session-audit")
            .await
            .unwrap();
        assert_eq!(creds.access_key_id, "ASIAEXAMPLE");
        assert_eq!(provider.assumed(), vec!["arn:aws:iam::1:role/audit".to_string()]);
    }
}
