//! HTTP utilities shared by the SaaS sources.
//!
//! Provides a client with retry, rate limiting and vendor authentication, a
//! `Link` header parser for cursor-less pagination, and a small async cache.

use crate::secure_string::SecureString;
use crate::traits::{AuthConfig, ConnectorConfig, ConnectorError, ConnectorResult};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use moka::future::Cache as MokaCache;
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, warn};

type RateLimiterType = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// HTTP client with retry, rate limiting and authentication.
pub struct HttpClient {
    client: Client,
    config: ConnectorConfig,
    /// Short-lived credential that overrides `config.auth` (GitHub installation tokens).
    session_token: Arc<RwLock<Option<SessionToken>>>,
    rate_limiter: Option<Arc<RateLimiterType>>,
}

/// A full `Authorization` header value with an expiry.
#[derive(Clone)]
struct SessionToken {
    header_value: SecureString,
    expires_at: Instant,
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionToken")
            .field("header_value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per period.
    pub max_requests: u32,
    /// Period duration.
    pub period: Duration,
    /// Maximum burst size.
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            period: Duration::from_secs(60),
            burst_size: 10,
        }
    }
}

impl HttpClient {
    /// Creates a new HTTP client from connector configuration.
    pub fn new(config: ConnectorConfig) -> ConnectorResult<Self> {
        Self::with_rate_limit(config, None)
    }

    /// Creates a new HTTP client with rate limiting.
    pub fn with_rate_limit(
        config: ConnectorConfig,
        rate_limit: Option<RateLimitConfig>,
    ) -> ConnectorResult<Self> {
        // Certificate checks can only be relaxed in debug builds.
        let verify_tls = if !config.verify_tls {
            #[cfg(debug_assertions)]
            {
                warn!(
                    base_url = %config.base_url,
                    connector_name = %config.name,
                    "TLS certificate verification disabled (debug build)"
                );
                false
            }
            #[cfg(not(debug_assertions))]
            {
                warn!(
                    base_url = %config.base_url,
                    connector_name = %config.name,
                    "Ignoring verify_tls=false in release build"
                );
                true
            }
        } else {
            true
        };

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            if let (Ok(name), Ok(val)) = (
                reqwest::header::HeaderName::try_from(key.as_str()),
                reqwest::header::HeaderValue::try_from(value.as_str()),
            ) {
                headers.insert(name, val);
            }
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(!verify_tls)
            .user_agent(concat!("cloudits/", env!("CARGO_PKG_VERSION")))
            .pool_max_idle_per_host(10)
            .default_headers(headers)
            .build()
            .map_err(|e| ConnectorError::ConfigError(e.to_string()))?;

        let rate_limiter = match rate_limit {
            Some(rl) => {
                let per_request = rl.period / rl.max_requests.max(1);
                let quota = Quota::with_period(per_request)
                    .ok_or_else(|| {
                        ConnectorError::ConfigError("Invalid rate limit period".to_string())
                    })?
                    .allow_burst(NonZeroU32::new(rl.burst_size).unwrap_or(NonZeroU32::MIN));
                Some(Arc::new(GovernorRateLimiter::direct(quota)))
            }
            None => None,
        };

        Ok(Self {
            client,
            config,
            session_token: Arc::new(RwLock::new(None)),
            rate_limiter,
        })
    }

    /// Builds a URL from a path. Absolute URLs (pagination links) pass through.
    pub fn build_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.config.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{}/{}", base, path)
    }

    /// Gets the base URL.
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Installs a short-lived `Authorization` header value used instead of
    /// the configured auth until it expires.
    pub async fn set_session_token(&self, header_value: SecureString, ttl: Duration) {
        let mut token = self.session_token.write().await;
        *token = Some(SessionToken {
            header_value,
            expires_at: Instant::now() + ttl,
        });
    }

    /// Returns true if a session token is installed and has more than a
    /// minute left.
    pub async fn has_valid_session_token(&self) -> bool {
        let token = self.session_token.read().await;
        token
            .as_ref()
            .map(|t| t.expires_at > Instant::now() + Duration::from_secs(60))
            .unwrap_or(false)
    }

    /// Executes a GET request with retry logic.
    pub async fn get(&self, path: &str) -> ConnectorResult<Response> {
        let request = self.client.get(self.build_url(path));
        self.execute_with_retry(request, None).await
    }

    /// Executes a GET request with query parameters.
    ///
    /// Repeated keys are sent repeatedly (`eventType=a&eventType=b`).
    pub async fn get_with_query<Q: Serialize + ?Sized>(
        &self,
        path: &str,
        query: &Q,
    ) -> ConnectorResult<Response> {
        let request = self.client.get(self.build_url(path)).query(query);
        self.execute_with_retry(request, None).await
    }

    /// Executes a GET request and deserializes the JSON response.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ConnectorResult<T> {
        let response = self.get(path).await?;
        parse_json_response(response).await
    }

    /// Executes a GET request with query parameters and deserializes the JSON response.
    pub async fn get_json_with_query<T: DeserializeOwned, Q: Serialize + ?Sized>(
        &self,
        path: &str,
        query: &Q,
    ) -> ConnectorResult<T> {
        let response = self.get_with_query(path, query).await?;
        parse_json_response(response).await
    }

    /// Collects a JSON array endpoint across `Link: rel="next"` pages.
    ///
    /// The query applies to the first request only; next links carry their own.
    pub async fn get_all_linked<Q: Serialize + ?Sized>(
        &self,
        path: &str,
        query: &Q,
        max_pages: usize,
    ) -> ConnectorResult<Vec<serde_json::Value>> {
        let mut items = Vec::new();
        let mut response = self.get_with_query(path, query).await?;

        for page in 1..=max_pages.max(1) {
            let next = next_link(response.headers());
            let batch: Vec<serde_json::Value> = parse_json_response(response).await?;
            items.extend(batch);

            match next {
                Some(url) if page < max_pages => {
                    debug!("Following next link to page {}", page + 1);
                    response = self.get(&url).await?;
                }
                Some(_) => {
                    warn!("Stopped after {} pages for {}", max_pages, path);
                    break;
                }
                None => break,
            }
        }
        Ok(items)
    }

    /// Executes a POST request with a JSON body and deserializes the response.
    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
    ) -> ConnectorResult<R> {
        let request = self.client.post(self.build_url(path)).json(body);
        let response = self.execute_with_retry(request, None).await?;
        parse_json_response(response).await
    }

    /// Executes a body-less POST with an explicit `Authorization` value,
    /// bypassing the configured auth.
    pub async fn post_authorized(
        &self,
        path: &str,
        authorization: &SecureString,
    ) -> ConnectorResult<Response> {
        let request = self.client.post(self.build_url(path));
        self.execute_with_retry(request, Some(authorization)).await
    }

    /// Executes a request with authentication, rate limiting, retries, and error handling.
    async fn execute_with_retry(
        &self,
        request: RequestBuilder,
        authorization: Option<&SecureString>,
    ) -> ConnectorResult<Response> {
        let request = match authorization {
            Some(value) => request.header("Authorization", value.expose_secret()),
            None => self.add_auth(request).await,
        };

        let mut last_error = None;
        let mut delay = Duration::from_millis(100);

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                debug!("Retry attempt {} after {:?}", attempt, delay);
                sleep(delay).await;
                delay = std::cmp::min(delay * 2 + rand_jitter(), Duration::from_secs(30));
            }

            if let Some(limiter) = &self.rate_limiter {
                limiter.until_ready().await;
            }

            let attempt_request = request
                .try_clone()
                .ok_or_else(|| ConnectorError::Internal("Failed to clone request".to_string()))?;

            let response = match attempt_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    last_error = Some(classify_transport_error(&e));
                    continue;
                }
            };

            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = retry_after_secs(response.headers());
                if attempt < self.config.max_retries {
                    warn!("Rate limited, waiting {} seconds", retry_after);
                    sleep(Duration::from_secs(retry_after)).await;
                    last_error = Some(ConnectorError::RateLimited(retry_after));
                    continue;
                }
                return Err(ConnectorError::RateLimited(retry_after));
            }

            if status.is_server_error() {
                warn!("Server error {} from {}", status, self.config.name);
                last_error = Some(ConnectorError::RequestFailed(format!(
                    "Server error: {}",
                    status
                )));
                continue;
            }

            if status.is_client_error() {
                return Err(client_error(response).await);
            }

            return Ok(response);
        }

        Err(last_error.unwrap_or_else(|| ConnectorError::Internal("Unknown error".to_string())))
    }

    /// Adds authentication to a request.
    async fn add_auth(&self, request: RequestBuilder) -> RequestBuilder {
        {
            let token = self.session_token.read().await;
            if let Some(t) = token.as_ref() {
                if t.expires_at > Instant::now() {
                    return request.header("Authorization", t.header_value.expose_secret());
                }
            }
        }

        match &self.config.auth {
            AuthConfig::None => request,
            AuthConfig::ApiKey { key, header_name } => {
                request.header(header_name, key.expose_secret())
            }
            AuthConfig::BearerToken { token } => {
                request.header("Authorization", format!("Bearer {}", token.expose_secret()))
            }
            AuthConfig::Basic { username, password } => {
                request.basic_auth(username, Some(password.expose_secret()))
            }
            AuthConfig::Scheme { scheme, token } => request.header(
                "Authorization",
                format!("{} {}", scheme, token.expose_secret()),
            ),
        }
    }
}

/// Parses a JSON response body, keeping a body excerpt in the error.
pub async fn parse_json_response<T: DeserializeOwned>(response: Response) -> ConnectorResult<T> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| ConnectorError::InvalidResponse(e.to_string()))?;

    serde_json::from_str(&text).map_err(|e| {
        ConnectorError::InvalidResponse(format!(
            "Failed to parse response (status {}): {} - Body: {}",
            status,
            e,
            text.chars().take(500).collect::<String>()
        ))
    })
}

fn classify_transport_error(e: &reqwest::Error) -> ConnectorError {
    if e.is_timeout() {
        ConnectorError::Timeout(e.to_string())
    } else if e.is_connect() {
        ConnectorError::ConnectionFailed(e.to_string())
    } else {
        ConnectorError::RequestFailed(e.to_string())
    }
}

async fn client_error(response: Response) -> ConnectorError {
    match response.status() {
        StatusCode::UNAUTHORIZED => ConnectorError::AuthenticationFailed("Unauthorized".into()),
        StatusCode::FORBIDDEN => ConnectorError::AuthorizationDenied("Forbidden".into()),
        StatusCode::NOT_FOUND => ConnectorError::NotFound(response.url().path().to_string()),
        status => {
            let body = response.text().await.unwrap_or_default();
            ConnectorError::RequestFailed(format!(
                "Client error {}: {}",
                status,
                body.chars().take(500).collect::<String>()
            ))
        }
    }
}

fn retry_after_secs(headers: &HeaderMap) -> u64 {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(60)
}

/// Extracts the `rel="next"` target from an RFC 5988 `Link` header.
pub fn next_link(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(reqwest::header::LINK)?.to_str().ok()?;
    parse_next_link(link)
}

fn parse_next_link(link: &str) -> Option<String> {
    link.split(',').find_map(|part| {
        let mut segments = part.split(';');
        let target = segments.next()?.trim();
        let is_next = segments.any(|s| {
            let s = s.trim();
            s == "rel=\"next\"" || s == "rel=next"
        });
        if is_next {
            Some(
                target
                    .trim_start_matches('<')
                    .trim_end_matches('>')
                    .to_string(),
            )
        } else {
            None
        }
    })
}

/// Generate a small random jitter for exponential backoff.
fn rand_jitter() -> Duration {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    Instant::now().hash(&mut hasher);
    Duration::from_millis(hasher.finish() % 100)
}

/// Async cache keyed by string, used to avoid repeating identical lookups.
pub struct ResponseCache<V: Clone + Send + Sync + 'static> {
    cache: MokaCache<String, V>,
}

impl<V: Clone + Send + Sync + 'static> ResponseCache<V> {
    /// Creates a new cache with the specified TTL and max capacity.
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        let cache = MokaCache::builder()
            .time_to_live(ttl)
            .max_capacity(max_capacity)
            .build();
        Self { cache }
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        self.cache.get(key).await
    }

    pub async fn insert(&self, key: String, value: V) {
        self.cache.insert(key, value).await;
    }

    /// Returns the cached value or computes it with a fallible async function.
    /// Errors are not cached.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: String, f: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<V, E>>,
    {
        if let Some(v) = self.cache.get(&key).await {
            return Ok(v);
        }
        let value = f().await?;
        self.cache.insert(key, value.clone()).await;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_connector_config;

    #[test]
    fn test_build_url() {
        let client = HttpClient::new(test_connector_config("t", "https://api.example.com/")).unwrap();
        assert_eq!(
            client.build_url("/api/v1/users"),
            "https://api.example.com/api/v1/users"
        );
        assert_eq!(
            client.build_url("api/v1/users"),
            "https://api.example.com/api/v1/users"
        );
        assert_eq!(
            client.build_url("https://other.example.com/page2"),
            "https://other.example.com/page2"
        );
    }

    #[test]
    fn test_parse_next_link() {
        let header = r#"<https://api.github.com/repositories/1/pulls?page=2>; rel="next", <https://api.github.com/repositories/1/pulls?page=5>; rel="last""#;
        assert_eq!(
            parse_next_link(header).as_deref(),
            Some("https://api.github.com/repositories/1/pulls?page=2")
        );

        let last_only = r#"<https://x.okta.com/api/v1/users?after=1>; rel="self""#;
        assert_eq!(parse_next_link(last_only), None);
    }

    #[test]
    fn test_retry_after_default() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after_secs(&headers), 60);
        headers.insert("retry-after", "7".parse().unwrap());
        assert_eq!(retry_after_secs(&headers), 7);
    }

    #[test]
    fn test_zero_request_rate_limit_is_rejected_gracefully() {
        let config = test_connector_config("t", "https://api.example.com");
        let rl = RateLimitConfig {
            max_requests: 10,
            period: Duration::from_secs(0),
            burst_size: 1,
        };
        assert!(HttpClient::with_rate_limit(config, Some(rl)).is_err());
    }

    #[tokio::test]
    async fn test_session_token_validity() {
        let client = HttpClient::new(test_connector_config("t", "https://api.example.com")).unwrap();
        assert!(!client.has_valid_session_token().await);
        client
            .set_session_token("token abc".into(), Duration::from_secs(3600))
            .await;
        assert!(client.has_valid_session_token().await);
    }

    #[tokio::test]
    async fn test_response_cache_skips_errors() {
        let cache: ResponseCache<String> = ResponseCache::new(Duration::from_secs(60), 10);
        let failed: Result<String, &str> = cache
            .get_or_try_insert_with("k".into(), || async { Err("boom") })
            .await;
        assert!(failed.is_err());
        assert_eq!(cache.get("k").await, None);

        let ok: Result<String, &str> = cache
            .get_or_try_insert_with("k".into(), || async { Ok("v".to_string()) })
            .await;
        assert_eq!(ok.unwrap(), "v");
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
    }
}
