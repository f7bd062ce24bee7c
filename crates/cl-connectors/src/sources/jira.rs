//! Jira Cloud evidence: tickets completed during the lookback window.

use crate::http::{HttpClient, RateLimitConfig};
use crate::traits::{
    unknown_collector, CollectionWindow, Connector, ConnectorConfig, ConnectorError,
    ConnectorHealth, ConnectorResult, EvidenceItem, EvidenceSource, Platform,
};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const SEARCH_PATH: &str = "/rest/api/3/search";
const PAGE_SIZE: u32 = 100;

/// Issue fields requested from the search API; also the CSV columns.
const JIRA_FIELDS: &[&str] = &[
    "id",
    "key",
    "summary",
    "description",
    "reporter",
    "assignee",
    "status",
    "created",
    "updated",
    "resolutiondate",
    "priority",
    "labels",
    "fixVersions",
    "components",
    "issuetype",
];

static PROJECT_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z][A-Z0-9_]{1,9}$").expect("valid project key regex"));

/// Returns true for a well-formed Jira project key such as `SEC` or `OPS2`.
pub fn validate_project_key(key: &str) -> bool {
    PROJECT_KEY.is_match(key)
}

/// A named group of projects whose tickets are filed together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JiraProjectGroup {
    /// Group name used in artifact names, e.g. `corp-dev`.
    pub name: String,
    pub project_keys: Vec<String>,
}

/// Jira source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JiraConfig {
    #[serde(flatten)]
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub project_groups: Vec<JiraProjectGroup>,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

fn default_lookback_days() -> i64 {
    31
}

fn default_max_pages() -> usize {
    20
}

/// Jira evidence source (basic auth with account email and API token).
pub struct JiraSource {
    config: JiraConfig,
    client: HttpClient,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchPage {
    #[serde(default)]
    issues: Vec<Value>,
    #[serde(default)]
    total: usize,
}

impl JiraSource {
    pub fn new(config: JiraConfig) -> ConnectorResult<Self> {
        let rate_limit = RateLimitConfig {
            max_requests: 100,
            period: Duration::from_secs(60),
            burst_size: 20,
        };
        let client = HttpClient::with_rate_limit(config.connector.clone(), Some(rate_limit))?;
        info!(
            "Jira source initialized for {} ({} project groups)",
            config.connector.base_url,
            config.project_groups.len()
        );
        Ok(Self { config, client })
    }

    async fn completed_tickets(
        &self,
        project_key: &str,
        window: &CollectionWindow,
    ) -> ConnectorResult<Vec<Value>> {
        let jql = completed_jql(project_key, window);
        let fields = JIRA_FIELDS.join(",");
        let max_results = PAGE_SIZE.to_string();
        let mut issues = Vec::new();

        for _ in 0..self.config.max_pages.max(1) {
            let start_at = issues.len().to_string();
            let query = [
                ("jql", jql.as_str()),
                ("fields", fields.as_str()),
                ("maxResults", max_results.as_str()),
                ("startAt", start_at.as_str()),
            ];
            let page: SearchPage = self.client.get_json_with_query(SEARCH_PATH, &query).await?;
            let fetched = page.issues.len();
            issues.extend(page.issues);

            if fetched == 0 || issues.len() >= page.total {
                break;
            }
        }

        debug!("Fetched {} completed tickets for {}", issues.len(), project_key);
        Ok(issues.into_iter().map(strip_avatars).collect())
    }
}

/// JQL for tickets resolved as Done since the start of the window.
fn completed_jql(project_key: &str, window: &CollectionWindow) -> String {
    format!(
        "project={} AND status=Done AND resolutiondate >= '{}'",
        project_key,
        window.start.format("%Y-%m-%d")
    )
}

/// Drops avatar URL maps from the reporter and assignee.
fn strip_avatars(mut issue: Value) -> Value {
    if let Some(fields) = issue.get_mut("fields").and_then(|f| f.as_object_mut()) {
        for person in ["reporter", "assignee"] {
            if let Some(Value::Object(map)) = fields.get_mut(person) {
                map.remove("avatarUrls");
            }
        }
    }
    issue
}

/// Flattens an issue into a CSV row.
fn issue_row(issue: &Value) -> Value {
    let empty = Value::Object(Default::default());
    let fields = issue.get("fields").unwrap_or(&empty);
    let text = |name: &str| fields.get(name).cloned().unwrap_or_else(|| json!(""));
    let nested = |name: &str, inner: &str| {
        fields
            .get(name)
            .and_then(|v| v.get(inner))
            .cloned()
            .unwrap_or_else(|| json!(""))
    };
    let names = |name: &str| {
        fields
            .get(name)
            .and_then(|v| v.as_array())
            .map(|list| {
                list.iter()
                    .filter_map(|item| item.get("name").and_then(|n| n.as_str()))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default()
    };
    let labels = fields
        .get("labels")
        .and_then(|v| v.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|l| l.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();
    let assignee = match fields.get("assignee") {
        Some(Value::Object(a)) => a.get("displayName").cloned().unwrap_or_else(|| json!("")),
        _ => json!("Unassigned"),
    };

    json!({
        "id": issue.get("id"),
        "key": issue.get("key"),
        "summary": text("summary"),
        "description": text("description"),
        "reporter": nested("reporter", "displayName"),
        "assignee": assignee,
        "status": nested("status", "name"),
        "created": text("created"),
        "updated": text("updated"),
        "resolutiondate": text("resolutiondate"),
        "priority": nested("priority", "name"),
        "labels": labels,
        "fixVersions": names("fixVersions"),
        "components": names("components"),
        "issuetype": nested("issuetype", "name"),
    })
}

#[async_trait]
impl Connector for JiraSource {
    fn name(&self) -> &str {
        &self.config.connector.name
    }

    fn platform(&self) -> Platform {
        Platform::Jira
    }

    async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
        match self.client.get("/rest/api/3/myself").await {
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
impl EvidenceSource for JiraSource {
    fn collectors(&self) -> Vec<&'static str> {
        vec!["completed_tickets"]
    }

    #[instrument(skip(self, window), fields(source = "jira"))]
    async fn collect(
        &self,
        collector: &str,
        window: &CollectionWindow,
    ) -> ConnectorResult<Vec<EvidenceItem>> {
        if collector != "completed_tickets" {
            return Err(unknown_collector(Platform::Jira, collector));
        }

        let lookback = CollectionWindow::ending_at(window.end, self.config.lookback_days);
        let mut items = Vec::new();
        for group in &self.config.project_groups {
            for key in &group.project_keys {
                if !validate_project_key(key) {
                    warn!("Skipping invalid Jira project key '{}' in group {}", key, group.name);
                    continue;
                }
                let issues = self.completed_tickets(key, &lookback).await?;
                let rows = issues.iter().map(issue_row).collect();
                items.push(
                    EvidenceItem::tabular(
                        format!("{}-{}", group.name, key),
                        Value::Array(issues),
                        JIRA_FIELDS,
                    )
                    .with_csv_rows(rows),
                );
            }
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_validate_project_key() {
        assert!(validate_project_key("SEC"));
        assert!(validate_project_key("OPS_2"));
        assert!(!validate_project_key("<PLACEHOLDER>"));
        assert!(!validate_project_key("sec"));
        assert!(!validate_project_key("S"));
        assert!(!validate_project_key("SEC; DROP"));
    }

    #[test]
    fn test_completed_jql() {
        let end = Utc.with_ymd_and_hms(2024, 3, 31, 9, 0, 0).unwrap();
        let window = CollectionWindow::ending_at(end, 31);
        assert_eq!(
            completed_jql("SEC", &window),
            "project=SEC AND status=Done AND resolutiondate >= '2024-02-29'"
        );
    }

    #[test]
    fn test_strip_avatars() {
        let issue = strip_avatars(json!({
            "key": "SEC-1",
            "fields": {
                "reporter": {"displayName": "R", "avatarUrls": {"48x48": "u"}},
                "assignee": null
            }
        }));
        assert!(issue["fields"]["reporter"].get("avatarUrls").is_none());
        assert_eq!(issue["fields"]["reporter"]["displayName"], "R");
    }

    #[test]
    fn test_issue_row_flattening() {
        let row = issue_row(&json!({
            "id": "10001",
            "key": "SEC-1",
            "fields": {
                "summary": "Rotate keys",
                "reporter": {"displayName": "Rita"},
                "assignee": null,
                "status": {"name": "Done"},
                "priority": {"name": "High"},
                "labels": ["audit", "q1"],
                "fixVersions": [{"name": "1.0"}],
                "components": [{"name": "infra"}, {"name": "iam"}],
                "issuetype": {"name": "Task"}
            }
        }));
        assert_eq!(row["assignee"], "Unassigned");
        assert_eq!(row["reporter"], "Rita");
        assert_eq!(row["labels"], "audit, q1");
        assert_eq!(row["components"], "infra, iam");
        assert_eq!(row["description"], "");
        assert_eq!(row["issuetype"], "Task");
    }
}
