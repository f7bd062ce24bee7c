//! Okta identity evidence: users and groups, MFA enrollments, deprovisioned
//! users and authentication policies.

use crate::http::HttpClient;
use crate::traits::{
    unknown_collector, CollectionWindow, Connector, ConnectorConfig, ConnectorError,
    ConnectorHealth, ConnectorResult, EvidenceItem, EvidenceSource, Platform,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, instrument, warn};

/// Policy types whose rules are exported as authentication settings.
const POLICY_TYPES: &[&str] = &["OKTA_SIGN_ON", "PASSWORD", "MFA_ENROLL", "ACCESS_POLICY"];

/// Okta source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OktaConfig {
    #[serde(flatten)]
    pub connector: ConnectorConfig,
    /// Maximum `Link`-header pages per listing.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

fn default_max_pages() -> usize {
    50
}

/// Okta evidence source (`Authorization: SSWS <token>`).
pub struct OktaSource {
    config: OktaConfig,
    client: HttpClient,
}

#[derive(Debug, Deserialize)]
struct OktaUser {
    id: String,
    #[serde(default)]
    profile: OktaProfile,
}

#[derive(Debug, Default, Deserialize)]
struct OktaProfile {
    #[serde(default)]
    login: String,
}

#[derive(Debug, Deserialize)]
struct OktaPolicy {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    policy_type: String,
}

impl OktaSource {
    pub fn new(config: OktaConfig) -> ConnectorResult<Self> {
        let client = HttpClient::new(config.connector.clone())?;
        info!("Okta source initialized for {}", config.connector.base_url);
        Ok(Self { config, client })
    }

    async fn list_users(&self, filter: Option<&str>) -> ConnectorResult<Vec<Value>> {
        let mut query: Vec<(&str, &str)> = vec![("limit", "200")];
        if let Some(filter) = filter {
            query.push(("filter", filter));
        }
        self.client
            .get_all_linked("/api/v1/users", &query, self.config.max_pages)
            .await
    }

    /// Fetches a per-user sub-resource for every user.
    async fn per_user(&self, sub_resource: &str, field: &str) -> ConnectorResult<Vec<Value>> {
        let users = self.list_users(None).await?;
        let mut output = Vec::with_capacity(users.len());

        for raw in users {
            let user: OktaUser = serde_json::from_value(raw)
                .map_err(|e| ConnectorError::InvalidResponse(format!("Bad Okta user: {}", e)))?;
            let path = format!("/api/v1/users/{}/{}", user.id, sub_resource);
            let related: Value = match self.client.get_json(&path).await {
                Ok(v) => v,
                Err(ConnectorError::NotFound(_)) => Value::Array(Vec::new()),
                Err(e) => return Err(e),
            };
            let mut entry = Map::new();
            entry.insert("id".to_string(), Value::String(user.id));
            entry.insert("username".to_string(), Value::String(user.profile.login));
            entry.insert(field.to_string(), related);
            output.push(Value::Object(entry));
        }
        Ok(output)
    }

    async fn authentication_settings(&self) -> ConnectorResult<Vec<Value>> {
        let mut output = Vec::new();
        for policy_type in POLICY_TYPES {
            let policies: Vec<OktaPolicy> = match self
                .client
                .get_json_with_query("/api/v1/policies", &[("type", *policy_type)])
                .await
            {
                Ok(p) => p,
                Err(e) => {
                    warn!("Skipping Okta policy type {}: {}", policy_type, e);
                    continue;
                }
            };

            for policy in policies {
                let rules: Value = self
                    .client
                    .get_json(&format!("/api/v1/policies/{}/rules", policy.id))
                    .await?;
                output.push(json!({
                    "id": policy.id,
                    "name": policy.name,
                    "type": policy.policy_type,
                    "rules": rules,
                }));
            }
        }
        Ok(output)
    }
}

#[async_trait]
impl Connector for OktaSource {
    fn name(&self) -> &str {
        &self.config.connector.name
    }

    fn platform(&self) -> Platform {
        Platform::Okta
    }

    async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
        match self.client.get("/api/v1/org").await {
            Ok(_) => Ok(ConnectorHealth::Healthy),
            Err(ConnectorError::AuthenticationFailed(_)) => {
                Ok(ConnectorHealth::Unhealthy("Authentication failed".to_string()))
            }
            Err(ConnectorError::ConnectionFailed(e)) => Ok(ConnectorHealth::Unhealthy(e)),
            Err(e) => Ok(ConnectorHealth::Degraded(e.to_string())),
        }
    }

    async fn test_connection(&self) -> ConnectorResult<bool> {
        Ok(matches!(self.health_check().await?, ConnectorHealth::Healthy))
    }
}

#[async_trait]
impl EvidenceSource for OktaSource {
    fn collectors(&self) -> Vec<&'static str> {
        vec![
            "users_and_groups",
            "mfa_enrollments",
            "deactivated_users",
            "authentication_settings",
        ]
    }

    #[instrument(skip(self, _window), fields(source = "okta"))]
    async fn collect(
        &self,
        collector: &str,
        _window: &CollectionWindow,
    ) -> ConnectorResult<Vec<EvidenceItem>> {
        let payload = match collector {
            "users_and_groups" => self.per_user("groups", "groups").await?,
            "mfa_enrollments" => self.per_user("factors", "factors").await?,
            "deactivated_users" => self.list_users(Some("status eq \"DEPROVISIONED\"")).await?,
            "authentication_settings" => self.authentication_settings().await?,
            other => return Err(unknown_collector(Platform::Okta, other)),
        };
        Ok(vec![EvidenceItem::json(collector, Value::Array(payload))])
    }
}
