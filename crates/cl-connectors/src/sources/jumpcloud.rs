//! JumpCloud directory evidence.
//!
//! Covers the directory itself (users, groups, systems and their
//! associations), device posture, application assignments, policies and
//! the system event categories auditors ask for.

use crate::http::HttpClient;
use crate::traits::{
    unknown_collector, CollectionWindow, Connector, ConnectorConfig, ConnectorError,
    ConnectorHealth, ConnectorResult, EvidenceItem, EvidenceSource, Platform,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

const PAGE_SIZE: usize = 100;
const EVENT_LIMIT: &str = "1000";

/// System event categories and the event types each one exports.
const EVENT_CATEGORIES: &[(&str, &[&str])] = &[
    (
        "admin_actions",
        &[
            "user.created",
            "user.deleted",
            "policy.updated",
            "policy.created",
            "policy.deleted",
            "group.created",
            "group.deleted",
            "group.updated",
        ],
    ),
    ("alerts_and_responses", &["alert.triggered", "alert.response"]),
    (
        "incident_resolution",
        &[
            "incident.response",
            "alert.response",
            "policy.updated",
            "user.updated",
        ],
    ),
    (
        "security_policies",
        &["policy.updated", "policy.created", "policy.deleted"],
    ),
    ("failed_logins", &["login.failed"]),
    ("device_location", &["device.location.updated"]),
    (
        "directory_changes",
        &[
            "directory.config.updated",
            "device.settings.updated",
            "policy.updated",
        ],
    ),
    ("api_interactions", &["api.request.success", "api.request.error"]),
];

/// JumpCloud source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JumpCloudConfig {
    #[serde(flatten)]
    pub connector: ConnectorConfig,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

fn default_max_pages() -> usize {
    100
}

/// JumpCloud evidence source (`x-api-key` header).
pub struct JumpCloudSource {
    config: JumpCloudConfig,
    client: HttpClient,
}

enum Cursor {
    Skip(usize),
    Link(String),
}

impl JumpCloudSource {
    pub fn new(config: JumpCloudConfig) -> ConnectorResult<Self> {
        let client = HttpClient::new(config.connector.clone())?;
        info!("JumpCloud source initialized for {}", config.connector.base_url);
        Ok(Self { config, client })
    }

    /// Lists every record of an endpoint.
    ///
    /// v2 endpoints return bare arrays and page with `limit`/`skip`; v1
    /// endpoints wrap records in `results` and may carry `links.next`.
    async fn fetch_all(&self, path: &str) -> ConnectorResult<Vec<Value>> {
        let mut items = Vec::new();
        let mut cursor = Cursor::Skip(0);

        for _ in 0..self.config.max_pages {
            let page: Value = match &cursor {
                Cursor::Skip(skip) => {
                    let query = [("limit", PAGE_SIZE.to_string()), ("skip", skip.to_string())];
                    self.client.get_json_with_query(path, &query).await?
                }
                Cursor::Link(url) => self.client.get_json(url).await?,
            };

            let (batch, next) = split_page(path, page)?;
            let count = batch.len();
            items.extend(batch);

            cursor = match (next, &cursor) {
                (Some(url), _) => Cursor::Link(url),
                (None, Cursor::Skip(skip)) if count == PAGE_SIZE => Cursor::Skip(skip + count),
                _ => break,
            };
        }

        debug!("Fetched {} items from {}", items.len(), path);
        Ok(items)
    }

    async fn systems(&self) -> ConnectorResult<Vec<Value>> {
        self.fetch_all("/systems").await
    }

    async fn users(&self) -> ConnectorResult<Vec<Value>> {
        self.fetch_all("/systemusers").await
    }

    /// Fetches a sub-listing for each parent and tags rows with the parent ID.
    async fn fan_out(
        &self,
        parents: Vec<Value>,
        path_for: impl Fn(&str) -> String,
        parent_field: &str,
    ) -> ConnectorResult<Vec<Value>> {
        let mut rows = Vec::new();
        for parent in parents {
            let Some(id) = parent.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            for mut row in self.fetch_all(&path_for(id)).await? {
                if let Value::Object(map) = &mut row {
                    map.insert(parent_field.to_string(), Value::String(id.to_string()));
                }
                rows.push(row);
            }
        }
        Ok(rows)
    }

    async fn app_users(&self) -> ConnectorResult<Vec<EvidenceItem>> {
        let apps: Vec<(String, String)> = self
            .fetch_all("/v2/applications")
            .await?
            .iter()
            .filter_map(|app| {
                let id = app.get("id").and_then(|v| v.as_str())?;
                let name = app
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("UnknownApp");
                Some((id.to_string(), name.to_string()))
            })
            .collect();

        let mut items = Vec::new();
        for (id, name) in &apps {
            let sanitized = sanitize_name(name);
            // Apps whose names sanitise alike are told apart by id.
            let shared = apps
                .iter()
                .filter(|(_, other)| sanitize_name(other) == sanitized)
                .count()
                > 1;
            let subject = if shared {
                format!("app-{}-{}-users", sanitized, sanitize_name(id))
            } else {
                format!("app-{}-users", sanitized)
            };

            let users = self.fetch_all(&format!("/v2/applications/{}/users", id)).await?;
            if users.is_empty() {
                debug!("No users found for application {}", name);
                continue;
            }
            let rows: Vec<Value> = users
                .iter()
                .map(|user| {
                    json!({
                        "id": user.get("id"),
                        "email": user.get("email"),
                        "username": user.get("username"),
                        "last_sign_on": user.get("last_sign_on").cloned().unwrap_or_else(|| json!("Never")),
                    })
                })
                .collect();
            items.push(EvidenceItem::json(subject, Value::Array(rows)));
        }
        Ok(items)
    }

    async fn groups_and_apps(&self) -> ConnectorResult<Vec<Value>> {
        let mut output = Vec::new();
        for group in self.fetch_all("/v2/groups").await? {
            let Some(id) = group.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            let apps = match self
                .fetch_all(&format!("/v2/groups/{}/applications", id))
                .await
            {
                Ok(apps) => apps,
                Err(e) => {
                    warn!("Failed to fetch applications for group {}: {}", id, e);
                    Vec::new()
                }
            };
            output.push(json!({
                "group_id": id,
                "group_name": group.get("name").and_then(|v| v.as_str()).unwrap_or("UnknownGroup"),
                "applications": apps
                    .iter()
                    .map(|app| json!({"id": app.get("id"), "name": app.get("name")}))
                    .collect::<Vec<_>>(),
            }));
        }
        Ok(output)
    }

    async fn events(
        &self,
        event_types: &[&str],
        window: &CollectionWindow,
    ) -> ConnectorResult<Vec<Value>> {
        let start = window.start.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string();
        let mut query: Vec<(&str, &str)> = vec![("startTime", start.as_str()), ("limit", EVENT_LIMIT)];
        for event_type in event_types {
            query.push(("eventType", *event_type));
        }

        let page: Value = self
            .client
            .get_json_with_query("/v2/systemevents", &query)
            .await?;
        let (events, _) = split_page("/v2/systemevents", page)?;
        Ok(events)
    }
}

fn split_page(path: &str, page: Value) -> ConnectorResult<(Vec<Value>, Option<String>)> {
    match page {
        Value::Array(batch) => Ok((batch, None)),
        Value::Object(mut map) => {
            let next = map
                .get("links")
                .and_then(|l| l.get("next"))
                .and_then(|n| n.as_str())
                .filter(|n| !n.is_empty())
                .map(str::to_string);
            match map.remove("results") {
                Some(Value::Array(batch)) => Ok((batch, next)),
                _ => Err(ConnectorError::InvalidResponse(format!(
                    "Malformed response from {}: 'results' key not found",
                    path
                ))),
            }
        }
        _ => Err(ConnectorError::InvalidResponse(format!(
            "Unexpected response shape from {}",
            path
        ))),
    }
}

/// Replaces every non-alphanumeric character with `_`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

fn field(device: &Value, name: &str) -> Value {
    device.get(name).cloned().unwrap_or(Value::Null)
}

fn managed_device(device: &Value) -> Value {
    json!({
        "id": field(device, "id"),
        "hostname": field(device, "hostname"),
        "os": field(device, "os"),
        "status": field(device, "system_connection_status"),
        "last_activity": field(device, "last_contact"),
    })
}

/// Devices with disk encryption, antivirus and screen lock all enabled.
fn compliant_devices(devices: &[Value]) -> Vec<Value> {
    devices
        .iter()
        .filter(|d| {
            d.get("disk_encryption_status").and_then(|v| v.as_str()) == Some("Enabled")
                && d.get("antivirus_installed").and_then(|v| v.as_str()) == Some("Yes")
                && d.get("screen_lock").and_then(|v| v.as_str()) == Some("Yes")
        })
        .map(|d| {
            let mut out = managed_device(d);
            if let Value::Object(map) = &mut out {
                map.insert("disk_encryption".into(), field(d, "disk_encryption_status"));
                map.insert("antivirus_installed".into(), field(d, "antivirus_installed"));
                map.insert("screen_lock".into(), field(d, "screen_lock"));
            }
            out
        })
        .collect()
}

fn compliance_status(devices: &[Value]) -> Vec<Value> {
    let or_unknown = |d: &Value, name: &str| d.get(name).cloned().unwrap_or_else(|| json!("Unknown"));
    devices
        .iter()
        .map(|d| {
            json!({
                "id": field(d, "id"),
                "hostname": field(d, "hostname"),
                "os": field(d, "os"),
                "disk_encryption": or_unknown(d, "disk_encryption_status"),
                "antivirus_installed": or_unknown(d, "antivirus_installed"),
                "screen_lock_enabled": or_unknown(d, "screen_lock"),
                "status": field(d, "system_connection_status"),
                "last_activity": field(d, "last_contact"),
            })
        })
        .collect()
}

/// Users whose `lockedOutUntil` falls within the lockout window.
fn locked_out_users(users: &[Value], window: &CollectionWindow) -> Vec<Value> {
    users
        .iter()
        .filter_map(|u| {
            let until = u.get("lockedOutUntil")?.as_str()?;
            if !window.contains_rfc3339(until) {
                return None;
            }
            Some(json!({
                "id": field(u, "id"),
                "email": field(u, "email"),
                "username": field(u, "username"),
                "locked_out_until": until,
            }))
        })
        .collect()
}

#[async_trait]
impl Connector for JumpCloudSource {
    fn name(&self) -> &str {
        &self.config.connector.name
    }

    fn platform(&self) -> Platform {
        Platform::JumpCloud
    }

    async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
        match self
            .client
            .get_with_query("/systemusers", &[("limit", "1")])
            .await
        {
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
impl EvidenceSource for JumpCloudSource {
    fn collectors(&self) -> Vec<&'static str> {
        let mut collectors = vec![
            "users",
            "user_groups",
            "systems",
            "group_members",
            "user_systems",
            "applications",
            "app_users",
            "groups_and_apps",
            "password_policy",
            "policies",
            "managed_devices",
            "compliant_devices",
            "compliance_status",
            "locked_out_users",
        ];
        collectors.extend(EVENT_CATEGORIES.iter().map(|(name, _)| *name));
        collectors
    }

    #[instrument(skip(self, window), fields(source = "jumpcloud"))]
    async fn collect(
        &self,
        collector: &str,
        window: &CollectionWindow,
    ) -> ConnectorResult<Vec<EvidenceItem>> {
        let item = match collector {
            "users" => EvidenceItem::tabular(collector, Value::Array(self.users().await?), &[]),
            "user_groups" => EvidenceItem::tabular(
                collector,
                Value::Array(self.fetch_all("/v2/usergroups").await?),
                &[],
            ),
            "systems" => EvidenceItem::tabular(collector, Value::Array(self.systems().await?), &[]),
            "group_members" => {
                let groups = self.fetch_all("/v2/usergroups").await?;
                let rows = self
                    .fan_out(groups, |id| format!("/v2/usergroups/{}/members", id), "group_id")
                    .await?;
                EvidenceItem::tabular(collector, Value::Array(rows), &[])
            }
            "user_systems" => {
                let users = self.users().await?;
                let rows = self
                    .fan_out(users, |id| format!("/v2/users/{}/systems", id), "user_id")
                    .await?;
                EvidenceItem::tabular(collector, Value::Array(rows), &[])
            }
            "applications" => {
                EvidenceItem::json(collector, Value::Array(self.fetch_all("/v2/applications").await?))
            }
            "app_users" => return self.app_users().await,
            "groups_and_apps" => {
                EvidenceItem::json(collector, Value::Array(self.groups_and_apps().await?))
            }
            "password_policy" => {
                let policy: Value = self
                    .client
                    .get_json("/v2/systeminsights/settings/policies/password")
                    .await?;
                EvidenceItem::json(collector, policy)
            }
            "policies" => {
                EvidenceItem::json(collector, Value::Array(self.fetch_all("/v2/policies").await?))
            }
            "managed_devices" => {
                let devices = self.systems().await?;
                EvidenceItem::json(
                    collector,
                    Value::Array(devices.iter().map(managed_device).collect()),
                )
            }
            "compliant_devices" => {
                let devices = self.systems().await?;
                EvidenceItem::json(collector, Value::Array(compliant_devices(&devices)))
            }
            "compliance_status" => {
                let devices = self.systems().await?;
                EvidenceItem::json(collector, Value::Array(compliance_status(&devices)))
            }
            "locked_out_users" => {
                let users = self.users().await?;
                let lockout_window = CollectionWindow::ending_at(window.end, 31);
                EvidenceItem::json(
                    collector,
                    Value::Array(locked_out_users(&users, &lockout_window)),
                )
            }
            other => {
                let Some((_, event_types)) = EVENT_CATEGORIES.iter().find(|(name, _)| *name == other)
                else {
                    return Err(unknown_collector(Platform::JumpCloud, other));
                };
                EvidenceItem::json(collector, Value::Array(self.events(event_types, window).await?))
            }
        };
        Ok(vec![item])
    }
}
