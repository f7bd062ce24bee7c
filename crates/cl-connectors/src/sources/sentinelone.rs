//! SentinelOne EDR evidence.

use crate::http::HttpClient;
use crate::traits::{
    unknown_collector, CollectionWindow, Connector, ConnectorConfig, ConnectorError,
    ConnectorHealth, ConnectorResult, EvidenceItem, EvidenceSource, Platform,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

const API_PREFIX: &str = "/web/api/v2.1";

/// Collector name, endpoint and fixed filters.
const ENDPOINTS: &[(&str, &str, &[(&str, &str)])] = &[
    ("agents", "agents", &[]),
    ("policies", "policies", &[]),
    ("threats", "threats", &[]),
    ("quarantined_threats", "threats", &[("quarantined", "true")]),
    ("incidents", "incidents", &[]),
    ("integrations", "integrations", &[]),
    ("agent_configuration", "agents", &[("columns", "configuration")]),
];

/// SentinelOne source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelOneConfig {
    #[serde(flatten)]
    pub connector: ConnectorConfig,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

fn default_page_size() -> u32 {
    100
}

fn default_max_pages() -> usize {
    100
}

/// SentinelOne evidence source (`Authorization: APIToken <token>`).
pub struct SentinelOneSource {
    config: SentinelOneConfig,
    client: HttpClient,
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    data: Vec<Value>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pagination {
    next_cursor: Option<String>,
}

impl SentinelOneSource {
    pub fn new(config: SentinelOneConfig) -> ConnectorResult<Self> {
        let client = HttpClient::new(config.connector.clone())?;
        info!("SentinelOne source initialized for {}", config.connector.base_url);
        Ok(Self { config, client })
    }

    /// Walks `pagination.nextCursor` until the listing is exhausted.
    async fn list(&self, endpoint: &str, filters: &[(&str, &str)]) -> ConnectorResult<Vec<Value>> {
        let path = format!("{}/{}", API_PREFIX, endpoint);
        let limit = self.config.page_size.to_string();
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for page_number in 1..=self.config.max_pages.max(1) {
            let mut query: Vec<(&str, &str)> = vec![("limit", limit.as_str())];
            query.extend_from_slice(filters);
            if let Some(cursor) = cursor.as_deref() {
                query.push(("cursor", cursor));
            }

            let page: Page = self.client.get_json_with_query(&path, &query).await?;
            items.extend(page.data);

            cursor = page
                .pagination
                .and_then(|p| p.next_cursor)
                .filter(|c| !c.is_empty());
            if cursor.is_none() {
                break;
            }
            if page_number == self.config.max_pages {
                warn!("Stopped after {} pages for {}", page_number, path);
            }
        }

        debug!("Fetched {} items from {}", items.len(), path);
        Ok(items)
    }
}

#[async_trait]
impl Connector for SentinelOneSource {
    fn name(&self) -> &str {
        &self.config.connector.name
    }

    fn platform(&self) -> Platform {
        Platform::SentinelOne
    }

    async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
        let path = format!("{}/system/status", API_PREFIX);
        match self.client.get(&path).await {
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
impl EvidenceSource for SentinelOneSource {
    fn collectors(&self) -> Vec<&'static str> {
        ENDPOINTS.iter().map(|(name, _, _)| *name).collect()
    }

    #[instrument(skip(self, _window), fields(source = "sentinelone"))]
    async fn collect(
        &self,
        collector: &str,
        _window: &CollectionWindow,
    ) -> ConnectorResult<Vec<EvidenceItem>> {
        let Some((_, endpoint, filters)) = ENDPOINTS.iter().find(|(name, _, _)| *name == collector)
        else {
            return Err(unknown_collector(Platform::SentinelOne, collector));
        };
        let data = self.list(endpoint, filters).await?;
        Ok(vec![EvidenceItem::json(collector, Value::Array(data))])
    }
}
