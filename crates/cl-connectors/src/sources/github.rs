//! GitHub change-management evidence, authenticated as a GitHub App.
//!
//! The App's private key signs a short-lived RS256 JWT which is exchanged
//! for an installation token; the installation token is then installed on
//! the HTTP client as a session credential until it expires.

use crate::http::{next_link, parse_json_response, HttpClient};
use crate::secure_string::SecureString;
use crate::traits::{
    unknown_collector, CollectionWindow, Connector, ConnectorConfig, ConnectorError,
    ConnectorHealth, ConnectorResult, EvidenceItem, EvidenceSource, Platform,
};
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Installation tokens live for an hour; refresh a little early.
const INSTALLATION_TOKEN_TTL: Duration = Duration::from_secs(55 * 60);

const PULL_REQUEST_COLUMNS: &[&str] = &[
    "id",
    "number",
    "title",
    "description",
    "state",
    "created_at",
    "updated_at",
    "merged_at",
    "user",
    "assignees",
    "labels",
    "base_branch",
    "head_branch",
    "url",
];

const REVIEW_COLUMNS: &[&str] = &[
    "repo",
    "pr_number",
    "pr_title",
    "reviewer",
    "state",
    "submitted_at",
    "url",
];

const RUN_COLUMNS: &[&str] = &[
    "repo",
    "workflow_id",
    "run_id",
    "status",
    "conclusion",
    "created_at",
    "updated_at",
    "event",
    "actor",
    "url",
];

/// GitHub App source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    #[serde(flatten)]
    pub connector: ConnectorConfig,
    pub app_id: String,
    pub installation_id: String,
    /// PEM encoded RSA private key of the App.
    pub private_key: SecureString,
    pub org: String,
    #[serde(default)]
    pub repos: Vec<String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_pr_lookback")]
    pub pull_request_lookback_days: i64,
    #[serde(default = "default_security_lookback")]
    pub security_lookback_days: i64,
}

fn default_max_pages() -> usize {
    10
}

fn default_pr_lookback() -> i64 {
    190
}

fn default_security_lookback() -> i64 {
    90
}

#[derive(Debug, Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Debug, Deserialize)]
struct InstallationToken {
    token: SecureString,
}

/// GitHub evidence source.
pub struct GitHubSource {
    config: GitHubConfig,
    client: HttpClient,
}

impl GitHubSource {
    pub fn new(mut config: GitHubConfig) -> ConnectorResult<Self> {
        if config.org.is_empty() {
            return Err(ConnectorError::ConfigError(
                "GitHub organization is required".to_string(),
            ));
        }
        config
            .connector
            .headers
            .entry("Accept".to_string())
            .or_insert_with(|| "application/vnd.github.v3+json".to_string());

        let client = HttpClient::new(config.connector.clone())?;
        info!(
            "GitHub source initialized for org {} ({} repos)",
            config.org,
            config.repos.len()
        );
        Ok(Self { config, client })
    }

    /// Signs the App JWT: `iat` now, `exp` ten minutes later, `iss` the App ID.
    fn app_jwt(&self) -> ConnectorResult<String> {
        let pem = self.config.private_key.expose_secret().replace("\\n", "\n");
        let key = EncodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| {
            ConnectorError::ConfigError(format!("Invalid GitHub App private key: {}", e))
        })?;

        let now = Utc::now().timestamp();
        let claims = AppClaims {
            iat: now,
            exp: now + 10 * 60,
            iss: self.config.app_id.clone(),
        };
        encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| ConnectorError::Internal(format!("Failed to sign GitHub App JWT: {}", e)))
    }

    /// Exchanges the App JWT for an installation token unless a valid one is held.
    async fn ensure_installation_token(&self) -> ConnectorResult<()> {
        if self.client.has_valid_session_token().await {
            return Ok(());
        }

        let jwt = SecureString::new(format!("Bearer {}", self.app_jwt()?));
        let path = format!(
            "/app/installations/{}/access_tokens",
            self.config.installation_id
        );
        let response = self.client.post_authorized(&path, &jwt).await?;
        if response.status() != StatusCode::CREATED {
            return Err(ConnectorError::AuthenticationFailed(format!(
                "Failed to get installation token: {}",
                response.status()
            )));
        }

        let token: InstallationToken = parse_json_response(response).await?;
        let header = SecureString::new(format!("token {}", token.token.expose_secret()));
        self.client
            .set_session_token(header, INSTALLATION_TOKEN_TTL)
            .await;
        debug!("Installed GitHub installation token");
        Ok(())
    }

    /// Follows `Link: rel="next"` up to `max_pages`, accepting either a bare
    /// array or an object keyed by `items_key`. An empty page stops early.
    async fn paginate(&self, path: &str, items_key: Option<&str>) -> ConnectorResult<Vec<Value>> {
        self.ensure_installation_token().await?;

        let mut url = Some(path.to_string());
        let mut results = Vec::new();
        let mut pages = 0;

        while let Some(current) = url.take() {
            if pages >= self.config.max_pages {
                warn!("Stopped after {} pages for {}", pages, path);
                break;
            }
            let response = self.client.get(&current).await?;
            let next = next_link(response.headers());
            let body: Value = parse_json_response(response).await?;

            let items = match (body, items_key) {
                (Value::Array(items), _) => items,
                (Value::Object(mut map), Some(key)) => match map.remove(key) {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                },
                _ => Vec::new(),
            };
            if items.is_empty() {
                break;
            }
            results.extend(items);
            pages += 1;
            url = next;
        }
        Ok(results)
    }

    fn repo_path(&self, repo: &str, rest: &str) -> String {
        format!("/repos/{}/{}/{}", self.config.org, repo, rest)
    }

    async fn pull_requests(&self, window: &CollectionWindow) -> ConnectorResult<Vec<EvidenceItem>> {
        let lookback = CollectionWindow::ending_at(window.end, self.config.pull_request_lookback_days);
        let mut items = Vec::new();

        for repo in &self.config.repos {
            let pulls = self
                .paginate(&self.repo_path(repo, "pulls?state=all&per_page=100"), None)
                .await?;
            let cleaned: Vec<Value> = pulls
                .iter()
                .filter(|pr| created_since(pr, &lookback))
                .map(clean_pull_request)
                .collect();
            info!("{} pull requests for {} in lookback window", cleaned.len(), repo);

            items.push(EvidenceItem::tabular(
                format!("{}-pull-requests", repo),
                Value::Array(cleaned),
                PULL_REQUEST_COLUMNS,
            ));
        }
        Ok(items)
    }

    async fn pull_request_reviews(&self, window: &CollectionWindow) -> ConnectorResult<Vec<Value>> {
        let lookback = CollectionWindow::ending_at(window.end, self.config.security_lookback_days);
        let mut reviews = Vec::new();

        for repo in &self.config.repos {
            let pulls = self
                .paginate(&self.repo_path(repo, "pulls?state=all&per_page=100"), None)
                .await?;
            for pr in pulls.iter().filter(|pr| updated_since(pr, &lookback)) {
                let Some(number) = pr.get("number").and_then(|n| n.as_u64()) else {
                    continue;
                };
                let path = self.repo_path(repo, &format!("pulls/{}/reviews", number));
                for review in self.paginate(&path, None).await? {
                    let Some(submitted) = review.get("submitted_at").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    if !lookback.contains_rfc3339(submitted) {
                        continue;
                    }
                    reviews.push(json!({
                        "repo": repo,
                        "pr_number": number,
                        "pr_title": pr.get("title"),
                        "reviewer": login_or_unknown(review.get("user")),
                        "state": review.get("state"),
                        "submitted_at": submitted,
                        "url": pr.get("html_url"),
                    }));
                }
            }
        }
        Ok(reviews)
    }

    async fn actions_runs(&self, window: &CollectionWindow) -> ConnectorResult<Vec<Value>> {
        let lookback = CollectionWindow::ending_at(window.end, self.config.security_lookback_days);
        let mut runs = Vec::new();

        for repo in &self.config.repos {
            let path = self.repo_path(repo, "actions/runs?per_page=100");
            for run in self.paginate(&path, Some("workflow_runs")).await? {
                if !created_since(&run, &lookback) {
                    continue;
                }
                runs.push(json!({
                    "repo": repo,
                    "workflow_id": run.get("workflow_id"),
                    "run_id": run.get("id"),
                    "status": run.get("status"),
                    "conclusion": run.get("conclusion"),
                    "created_at": run.get("created_at"),
                    "updated_at": run.get("updated_at"),
                    "event": run.get("event"),
                    "actor": login_or_unknown(run.get("actor")),
                    "url": run.get("html_url"),
                }));
            }
        }
        Ok(runs)
    }
}

fn created_since(item: &Value, window: &CollectionWindow) -> bool {
    item.get("created_at")
        .and_then(|v| v.as_str())
        .map(|s| window.contains_rfc3339(s))
        .unwrap_or(false)
}

fn updated_since(item: &Value, window: &CollectionWindow) -> bool {
    item.get("updated_at")
        .and_then(|v| v.as_str())
        .map(|s| window.contains_rfc3339(s))
        .unwrap_or(false)
}

fn login_or_unknown(user: Option<&Value>) -> String {
    user.and_then(|u| u.get("login"))
        .and_then(|l| l.as_str())
        .unwrap_or("Unknown")
        .to_string()
}

fn join_names(items: Option<&Value>, field: &str) -> String {
    items
        .and_then(|v| v.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|item| item.get(field).and_then(|v| v.as_str()))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default()
}

/// Reduces a pull request to the fields kept as change-management evidence.
fn clean_pull_request(pr: &Value) -> Value {
    let description = pr
        .get("body")
        .and_then(|b| b.as_str())
        .unwrap_or("")
        .replace('\n', " ");
    let branch = |side: &str| {
        pr.get(side)
            .and_then(|b| b.get("ref"))
            .and_then(|r| r.as_str())
            .unwrap_or("")
            .to_string()
    };

    json!({
        "id": pr.get("id"),
        "number": pr.get("number"),
        "title": pr.get("title"),
        "description": description,
        "state": pr.get("state"),
        "created_at": pr.get("created_at"),
        "updated_at": pr.get("updated_at"),
        "merged_at": pr.get("merged_at"),
        "user": login_or_unknown(pr.get("user")),
        "assignees": join_names(pr.get("assignees"), "login"),
        "labels": join_names(pr.get("labels"), "name"),
        "base_branch": branch("base"),
        "head_branch": branch("head"),
        "url": pr.get("html_url"),
    })
}

#[async_trait]
impl Connector for GitHubSource {
    fn name(&self) -> &str {
        &self.config.connector.name
    }

    fn platform(&self) -> Platform {
        Platform::GitHub
    }

    async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
        match self.ensure_installation_token().await {
            Ok(()) => Ok(ConnectorHealth::Healthy),
            Err(ConnectorError::ConfigError(e)) | Err(ConnectorError::AuthenticationFailed(e)) => {
                Ok(ConnectorHealth::Unhealthy(e))
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
impl EvidenceSource for GitHubSource {
    fn collectors(&self) -> Vec<&'static str> {
        vec!["pull_requests", "pull_request_reviews", "actions_runs"]
    }

    #[instrument(skip(self, window), fields(source = "github", org = %self.config.org))]
    async fn collect(
        &self,
        collector: &str,
        window: &CollectionWindow,
    ) -> ConnectorResult<Vec<EvidenceItem>> {
        match collector {
            "pull_requests" => self.pull_requests(window).await,
            "pull_request_reviews" => Ok(vec![EvidenceItem::tabular(
                collector,
                Value::Array(self.pull_request_reviews(window).await?),
                REVIEW_COLUMNS,
            )]),
            "actions_runs" => Ok(vec![EvidenceItem::tabular(
                "github_actions_runs",
                Value::Array(self.actions_runs(window).await?),
                RUN_COLUMNS,
            )]),
            other => Err(unknown_collector(Platform::GitHub, other)),
        }
    }
}
