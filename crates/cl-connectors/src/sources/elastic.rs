//! Elastic SIEM evidence: cluster security settings, snapshot and ILM
//! configuration, Fleet agents, and searches over cases and endpoint logs.

use crate::http::HttpClient;
use crate::traits::{
    unknown_collector, CollectionWindow, Connector, ConnectorConfig, ConnectorError,
    ConnectorHealth, ConnectorResult, EvidenceItem, EvidenceSource, Platform,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};

/// Index patterns searched by the log-based collectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticIndices {
    #[serde(default = "default_cases_index")]
    pub cases: String,
    #[serde(default = "default_endpoint_index")]
    pub endpoint_events: String,
    #[serde(default = "default_audit_index")]
    pub audit: String,
    #[serde(default = "default_updates_index")]
    pub system_updates: String,
}

fn default_cases_index() -> String {
    ".cases*".to_string()
}

fn default_endpoint_index() -> String {
    "logs-endpoint.events.*".to_string()
}

fn default_audit_index() -> String {
    "auditbeat-*".to_string()
}

fn default_updates_index() -> String {
    "logs-system.updates.*".to_string()
}

impl Default for ElasticIndices {
    fn default() -> Self {
        Self {
            cases: default_cases_index(),
            endpoint_events: default_endpoint_index(),
            audit: default_audit_index(),
            system_updates: default_updates_index(),
        }
    }
}

/// Elastic source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticConfig {
    #[serde(flatten)]
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub indices: ElasticIndices,
    /// Maximum hits returned per search.
    #[serde(default = "default_search_size")]
    pub search_size: u32,
}

fn default_search_size() -> u32 {
    1000
}

/// Elastic evidence source (`Authorization: ApiKey <key>`).
pub struct ElasticSource {
    config: ElasticConfig,
    client: HttpClient,
}

impl ElasticSource {
    pub fn new(config: ElasticConfig) -> ConnectorResult<Self> {
        let client = HttpClient::new(config.connector.clone())?;
        info!("Elastic source initialized for {}", config.connector.base_url);
        Ok(Self { config, client })
    }

    /// Fetches every snapshot repository along with its configuration.
    async fn snapshots(&self) -> ConnectorResult<Value> {
        let repositories: Map<String, Value> = self.client.get_json("/_snapshot").await?;
        let mut configs = Map::new();

        for name in repositories.keys() {
            let path = format!("/_snapshot/{}", urlencoding::encode(name));
            match self.client.get_json::<Value>(&path).await {
                Ok(config) => {
                    configs.insert(name.clone(), config);
                }
                Err(e) => warn!("Failed to fetch snapshot repository {}: {}", name, e),
            }
        }
        Ok(Value::Object(configs))
    }

    async fn fleet_agents(&self) -> ConnectorResult<Value> {
        let response: Value = self.client.get_json("/api/fleet/agents").await?;
        let agents = response
            .get("items")
            .or_else(|| response.get("list"))
            .and_then(|v| v.as_array())
            .map(|items| items.iter().map(agent_summary).collect())
            .unwrap_or_default();
        Ok(Value::Array(agents))
    }

    /// Runs a search and returns the hit list.
    async fn search(&self, index: &str, query: Value, sort_field: Option<&str>) -> ConnectorResult<Value> {
        let mut body = json!({
            "size": self.config.search_size,
            "query": query,
        });
        if let Some(field) = sort_field {
            body["sort"] = json!([{ field: {"order": "desc"} }]);
        }

        let path = format!("/{}/_search", urlencoding::encode(index));
        let response: Value = self.client.post_json(&path, &body).await?;
        let hits = response
            .pointer("/hits/hits")
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        debug!(
            "Search on {} returned {} hits",
            index,
            hits.as_array().map(Vec::len).unwrap_or(0)
        );
        Ok(hits)
    }

    async fn cases(&self, status: &str) -> ConnectorResult<Value> {
        let query = json!({"term": {"cases.attributes.status.keyword": status}});
        self.search(&self.config.indices.cases, query, Some("cases.attributes.created_at"))
            .await
    }
}

/// Flattens a Fleet agent record into the device fields auditors ask for.
fn agent_summary(agent: &Value) -> Value {
    json!({
        "id": agent.get("id"),
        "name": agent.pointer("/local_metadata/host/name"),
        "os": agent.pointer("/local_metadata/os/full"),
        "ip": agent.pointer("/local_metadata/host/ip"),
        "status": agent.get("status"),
        "policy_id": agent.get("policy_id"),
    })
}

/// Builds a `bool.must` query of `match` clauses limited to the window.
fn events_query(matches: &[(&str, Value)], window: &CollectionWindow) -> Value {
    let mut must: Vec<Value> = matches
        .iter()
        .map(|(field, value)| {
            if value.is_array() {
                json!({"terms": { *field: value }})
            } else {
                json!({"match": { *field: value }})
            }
        })
        .collect();
    must.push(json!({
        "range": {
            "@timestamp": {
                "gte": window.start.to_rfc3339(),
                "lte": window.end.to_rfc3339(),
            }
        }
    }));
    json!({"bool": {"must": must}})
}

#[async_trait]
impl Connector for ElasticSource {
    fn name(&self) -> &str {
        &self.config.connector.name
    }

    fn platform(&self) -> Platform {
        Platform::Elastic
    }

    async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
        match self.client.get_json::<Value>("/_cluster/health").await {
            Ok(health) => match health.get("status").and_then(|s| s.as_str()) {
                Some("red") => Ok(ConnectorHealth::Degraded("Cluster status red".to_string())),
                _ => Ok(ConnectorHealth::Healthy),
            },
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
impl EvidenceSource for ElasticSource {
    fn collectors(&self) -> Vec<&'static str> {
        vec![
            "snapshots",
            "ilm_policies",
            "security_roles",
            "security_users",
            "fleet_agents",
            "open_cases",
            "closed_cases",
            "endpoint_isolation",
            "siem_edr_changes",
            "applied_patches",
        ]
    }

    #[instrument(skip(self, window), fields(source = "elastic"))]
    async fn collect(
        &self,
        collector: &str,
        window: &CollectionWindow,
    ) -> ConnectorResult<Vec<EvidenceItem>> {
        let indices = &self.config.indices;
        let payload = match collector {
            "snapshots" => self.snapshots().await?,
            "ilm_policies" => self.client.get_json("/_ilm/policy").await?,
            "security_roles" => self.client.get_json("/_security/role").await?,
            "security_users" => self.client.get_json("/_security/user").await?,
            "fleet_agents" => self.fleet_agents().await?,
            "open_cases" => self.cases("open").await?,
            "closed_cases" => self.cases("closed").await?,
            "endpoint_isolation" => {
                let query = events_query(
                    &[
                        ("event.action", json!("isolate")),
                        ("event.module", json!("endpoint")),
                    ],
                    window,
                );
                self.search(&indices.endpoint_events, query, Some("@timestamp"))
                    .await?
            }
            "siem_edr_changes" => {
                let query = events_query(
                    &[
                        ("event.category", json!("configuration")),
                        ("event.action", json!("change")),
                        ("event.module", json!("security")),
                    ],
                    window,
                );
                self.search(&indices.audit, query, Some("@timestamp")).await?
            }
            "applied_patches" => {
                let query = events_query(
                    &[
                        ("event.category", json!("package")),
                        ("event.action", json!(["install", "update", "patch"])),
                    ],
                    window,
                );
                self.search(&indices.system_updates, query, Some("@timestamp"))
                    .await?
            }
            other => return Err(unknown_collector(Platform::Elastic, other)),
        };
        Ok(vec![EvidenceItem::json(collector, payload)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_summary_fields() {
        let agent = json!({
            "id": "a1",
            "status": "online",
            "policy_id": "p1",
            "local_metadata": {
                "host": {"name": "web-1", "ip": ["10.0.0.1"]},
                "os": {"full": "Ubuntu 22.04"}
            }
        });
        let summary = agent_summary(&agent);
        assert_eq!(summary["name"], "web-1");
        assert_eq!(summary["os"], "Ubuntu 22.04");
        assert_eq!(summary["ip"], json!(["10.0.0.1"]));
        assert_eq!(agent_summary(&json!({"id": "a2"}))["name"], Value::Null);
    }

    #[test]
    fn test_events_query_shape() {
        let window = CollectionWindow::last_days(30);
        let query = events_query(
            &[
                ("event.category", json!("package")),
                ("event.action", json!(["install", "patch"])),
            ],
            &window,
        );
        let must = query["bool"]["must"].as_array().unwrap();
        assert_eq!(must.len(), 3);
        assert_eq!(must[0]["match"]["event.category"], "package");
        assert_eq!(must[1]["terms"]["event.action"], json!(["install", "patch"]));
        assert!(must[2]["range"]["@timestamp"]["gte"].is_string());
    }

    #[test]
    fn test_default_indices() {
        let config: ElasticConfig = serde_json::from_value(json!({
            "name": "elastic",
            "base_url": "https://es.example.com",
            "auth": {"type": "scheme", "scheme": "ApiKey", "token": "k"},
            "indices": {"audit": "audit-*"}
        }))
        .unwrap();
        assert_eq!(config.indices.cases, ".cases*");
        assert_eq!(config.indices.audit, "audit-*");
        assert_eq!(config.search_size, 1000);
    }
}
