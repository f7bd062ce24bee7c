//! Generic AWS API invoker.
//!
//! [`AwsHttpClient`] turns `(service, operation, params)` into a signed HTTP
//! request using the service catalog, so any read-only operation named in a
//! framework mapping can be called without a per-service SDK client.

use super::catalog::{self, Protocol, ServiceSpec};
use super::credentials::AwsCredentials;
use super::signer::{self, SignableRequest, SigningParams};
use super::xml;
use crate::traits::{ConnectorError, ConnectorResult};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Invokes one AWS API operation and returns its output as JSON.
#[async_trait]
pub trait AwsApi: Send + Sync {
    /// `operation` is snake_case (`describe_db_instances`) or an explicit
    /// PascalCase wire action (`DescribeDBInstances`).
    async fn call(
        &self,
        service: &str,
        operation: &str,
        region: &str,
        params: &Value,
    ) -> ConnectorResult<Value>;
}

/// Builds an [`AwsApi`] for a set of assumed-role credentials.
pub trait AwsApiFactory: Send + Sync {
    fn for_credentials(&self, credentials: AwsCredentials) -> ConnectorResult<Arc<dyn AwsApi>>;
}

/// Transport options for [`AwsHttpClient`].
#[derive(Debug, Clone)]
pub struct AwsClientOptions {
    pub timeout: Duration,
    pub max_retries: u32,
    /// Sends every request to this URL instead of the AWS endpoint.
    pub endpoint_override: Option<String>,
}

impl Default for AwsClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            endpoint_override: None,
        }
    }
}

/// Factory producing signed HTTP clients.
#[derive(Debug, Clone, Default)]
pub struct HttpApiFactory {
    pub options: AwsClientOptions,
}

impl AwsApiFactory for HttpApiFactory {
    fn for_credentials(&self, credentials: AwsCredentials) -> ConnectorResult<Arc<dyn AwsApi>> {
        Ok(Arc::new(AwsHttpClient::new(credentials, self.options.clone())?))
    }
}

/// Factory that hands out the same API regardless of credentials.
pub struct SharedApiFactory(pub Arc<dyn AwsApi>);

impl AwsApiFactory for SharedApiFactory {
    fn for_credentials(&self, _credentials: AwsCredentials) -> ConnectorResult<Arc<dyn AwsApi>> {
        Ok(Arc::clone(&self.0))
    }
}

/// Signed HTTP client for AWS query, JSON and REST APIs.
pub struct AwsHttpClient {
    client: Client,
    credentials: AwsCredentials,
    options: AwsClientOptions,
}

struct PreparedRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl AwsHttpClient {
    pub fn new(credentials: AwsCredentials, options: AwsClientOptions) -> ConnectorResult<Self> {
        let client = Client::builder()
            .timeout(options.timeout)
            .user_agent(format!("cloudits/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConnectorError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            credentials,
            options,
        })
    }

    fn prepare(
        &self,
        spec: &ServiceSpec,
        operation: &str,
        params: &Value,
    ) -> ConnectorResult<PreparedRequest> {
        let action = if operation.starts_with(|c: char| c.is_ascii_uppercase()) {
            operation.to_string()
        } else {
            spec.action_name(operation)
        };
        let empty = Map::new();
        let params = params.as_object().unwrap_or(&empty);

        match spec.protocol {
            Protocol::Json => Ok(PreparedRequest {
                method: Method::POST,
                path: "/".to_string(),
                query: Vec::new(),
                headers: vec![
                    (
                        "content-type".to_string(),
                        format!("application/x-amz-json-{}", spec.json_version),
                    ),
                    (
                        "x-amz-target".to_string(),
                        format!("{}.{}", spec.target_prefix, action),
                    ),
                ],
                body: serde_json::to_vec(params)
                    .map_err(|e| ConnectorError::InvalidRequest(e.to_string()))?,
            }),
            Protocol::Query | Protocol::Ec2 => {
                let mut form = vec![
                    ("Action".to_string(), action),
                    ("Version".to_string(), spec.api_version.to_string()),
                ];
                for (key, value) in params {
                    flatten_query(key, value, spec.protocol == Protocol::Ec2, &mut form);
                }
                let body = form
                    .iter()
                    .map(|(k, v)| {
                        format!("{}={}", signer::uri_encode(k, true), signer::uri_encode(v, true))
                    })
                    .collect::<Vec<_>>()
                    .join("&");
                Ok(PreparedRequest {
                    method: Method::POST,
                    path: "/".to_string(),
                    query: Vec::new(),
                    headers: vec![(
                        "content-type".to_string(),
                        "application/x-www-form-urlencoded; charset=utf-8".to_string(),
                    )],
                    body: body.into_bytes(),
                })
            }
            Protocol::RestJson | Protocol::RestXml => {
                let route = spec.route(operation)?;
                let mut remaining = params.clone();
                let (path, mut query) = expand_route(route.uri, &mut remaining)?;
                let method = Method::from_bytes(route.method.as_bytes())
                    .map_err(|e| ConnectorError::Internal(e.to_string()))?;

                for (member, key) in route.query {
                    if let Some(value) = remaining.remove(*member) {
                        push_query_value(key, &value, &mut query);
                    }
                }

                let mut headers = Vec::new();
                let mut body = Vec::new();
                if method == Method::GET {
                    for (key, value) in &remaining {
                        push_query_value(key, value, &mut query);
                    }
                } else if spec.protocol == Protocol::RestJson {
                    headers.push(("content-type".to_string(), "application/json".to_string()));
                    body = serde_json::to_vec(&remaining)
                        .map_err(|e| ConnectorError::InvalidRequest(e.to_string()))?;
                }

                Ok(PreparedRequest {
                    method,
                    path,
                    query,
                    headers,
                    body,
                })
            }
        }
    }

    async fn send_once(
        &self,
        spec: &ServiceSpec,
        region: &str,
        prepared: &PreparedRequest,
    ) -> ConnectorResult<(StatusCode, String)> {
        let endpoint = match &self.options.endpoint_override {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => spec.endpoint(region),
        };
        let query_string = prepared
            .query
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    signer::uri_encode(k, true)
                } else {
                    format!("{}={}", signer::uri_encode(k, true), signer::uri_encode(v, true))
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        let raw_url = if query_string.is_empty() {
            format!("{}{}", endpoint, prepared.path)
        } else {
            format!("{}{}?{}", endpoint, prepared.path, query_string)
        };
        let url = Url::parse(&raw_url)
            .map_err(|e| ConnectorError::ConfigError(format!("Invalid AWS endpoint {}: {}", raw_url, e)))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(ConnectorError::ConfigError(format!(
                    "AWS endpoint has no host: {}",
                    raw_url
                )))
            }
        };

        let session_token = self.credentials.session_token.as_ref().map(|t| t.expose_secret());
        let signed = signer::sign(
            &SignableRequest {
                method: prepared.method.as_str(),
                host: &host,
                path: &prepared.path,
                query: &prepared.query,
                headers: &prepared.headers,
                payload: &prepared.body,
            },
            &SigningParams {
                access_key_id: &self.credentials.access_key_id,
                secret_access_key: self.credentials.secret_access_key.expose_secret(),
                session_token,
                region: spec.signing_region(region),
                service: spec.signing_name,
                time: Utc::now(),
            },
        );

        let mut request = self.client.request(prepared.method.clone(), url);
        for (name, value) in prepared.headers.iter().chain(signed.iter()) {
            request = request.header(name.as_str(), value.as_str());
        }
        if !prepared.body.is_empty() {
            request = request.body(prepared.body.clone());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ConnectorError::Timeout(e.to_string())
            } else {
                ConnectorError::ConnectionFailed(e.to_string())
            }
        })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ConnectorError::InvalidResponse(e.to_string()))?;
        Ok((status, body))
    }
}

#[async_trait]
impl AwsApi for AwsHttpClient {
    #[instrument(skip(self, params))]
    async fn call(
        &self,
        service: &str,
        operation: &str,
        region: &str,
        params: &Value,
    ) -> ConnectorResult<Value> {
        let spec = catalog::service(service)?;
        let prepared = self.prepare(spec, operation, params)?;

        let mut attempt = 0;
        loop {
            let (err, retryable) = match self.send_once(spec, region, &prepared).await {
                Ok((status, body)) if status.is_success() => {
                    return parse_body(spec.protocol, &body);
                }
                Ok((status, body)) => {
                    let err = classify_error(service, operation, status, &body);
                    let retryable =
                        status.is_server_error() || matches!(err, ConnectorError::RateLimited(_));
                    (err, retryable)
                }
                Err(e) => {
                    let retryable = matches!(
                        e,
                        ConnectorError::ConnectionFailed(_) | ConnectorError::Timeout(_)
                    );
                    (e, retryable)
                }
            };

            if !retryable || attempt >= self.options.max_retries {
                return Err(err);
            }
            attempt += 1;
            let delay = Duration::from_millis(200 * 2u64.pow(attempt));
            warn!(service, operation, attempt, "Retrying AWS call after {:?}: {}", delay, err);
            tokio::time::sleep(delay).await;
        }
    }
}

fn parse_body(protocol: Protocol, body: &str) -> ConnectorResult<Value> {
    if body.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    match protocol {
        Protocol::Json | Protocol::RestJson => serde_json::from_str(body)
            .map_err(|e| ConnectorError::InvalidResponse(format!("Invalid JSON body: {}", e))),
        Protocol::Query | Protocol::RestXml => xml::xml_to_json(body, false),
        Protocol::Ec2 => xml::xml_to_json(body, true),
    }
}

/// Maps an AWS error response onto a [`ConnectorError`].
pub fn classify_error(service: &str, operation: &str, status: StatusCode, body: &str) -> ConnectorError {
    let (code, message) = error_details(body);
    debug!(service, operation, %status, code = %code, "AWS error response");

    let detail = format!("{}:{} {} {}: {}", service, operation, status.as_u16(), code, message);
    let code_lower = code.to_ascii_lowercase();

    if code_lower.contains("throttl") || code_lower.contains("toomanyrequests") || status == StatusCode::TOO_MANY_REQUESTS {
        ConnectorError::RateLimited(1)
    } else if code_lower.contains("accessdenied") || code_lower.contains("unauthorized") {
        ConnectorError::AuthorizationDenied(detail)
    } else if code_lower.contains("expiredtoken")
        || code_lower.contains("invalidclienttokenid")
        || code_lower.contains("signaturedoesnotmatch")
        || status == StatusCode::UNAUTHORIZED
    {
        ConnectorError::AuthenticationFailed(detail)
    } else if code_lower.contains("notfound") || code_lower.starts_with("nosuch") || status == StatusCode::NOT_FOUND {
        ConnectorError::NotFound(detail)
    } else if status == StatusCode::FORBIDDEN {
        ConnectorError::AuthorizationDenied(detail)
    } else {
        ConnectorError::RequestFailed(detail)
    }
}

fn error_details(body: &str) -> (String, String) {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let code = value
            .get("__type")
            .or_else(|| value.get("code"))
            .or_else(|| value.get("Code"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        // JSON services prefix the code with a shape namespace.
        let code = code.rsplit('#').next().unwrap_or(code).to_string();
        let message = value
            .get("message")
            .or_else(|| value.get("Message"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        return (code, message);
    }
    xml::error_code(body).unwrap_or_default()
}

/// Flattens a JSON parameter into query-protocol form fields.
///
/// Lists become `Name.member.N`; EC2 uses `Name.N` with the singular
/// member name (`InstanceIds` → `InstanceId.1`).
pub fn flatten_query(name: &str, value: &Value, ec2: bool, out: &mut Vec<(String, String)>) {
    match value {
        Value::Null => {}
        Value::Bool(b) => out.push((name.to_string(), b.to_string())),
        Value::Number(n) => out.push((name.to_string(), n.to_string())),
        Value::String(s) => out.push((name.to_string(), s.clone())),
        Value::Array(items) => {
            let base = if ec2 {
                ec2_list_name(name)
            } else {
                format!("{}.member", name)
            };
            for (i, item) in items.iter().enumerate() {
                flatten_query(&format!("{}.{}", base, i + 1), item, ec2, out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                flatten_query(&format!("{}.{}", name, key), item, ec2, out);
            }
        }
    }
}

fn ec2_list_name(name: &str) -> String {
    let (prefix, last) = match name.rsplit_once('.') {
        Some((prefix, last)) => (Some(prefix), last),
        None => (None, name),
    };
    let singular = last.strip_suffix('s').unwrap_or(last);
    match prefix {
        Some(prefix) => format!("{}.{}", prefix, singular),
        None => singular.to_string(),
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn push_query_value(key: &str, value: &Value, query: &mut Vec<(String, String)>) {
    match value {
        Value::Array(items) => {
            for item in items {
                if let Some(s) = scalar_string(item) {
                    query.push((key.to_string(), s));
                }
            }
        }
        other => {
            if let Some(s) = scalar_string(other) {
                query.push((key.to_string(), s));
            }
        }
    }
}

/// Fills a REST URI template, consuming the parameters it uses.
fn expand_route(
    template: &str,
    params: &mut Map<String, Value>,
) -> ConnectorResult<(String, Vec<(String, String)>)> {
    let (path_template, flags) = match template.split_once('?') {
        Some((path, flags)) => (path, Some(flags)),
        None => (template, None),
    };

    let mut path = String::with_capacity(path_template.len());
    let mut rest = path_template;
    while let Some(start) = rest.find('{') {
        path.push_str(&rest[..start]);
        let end = rest[start..]
            .find('}')
            .map(|i| start + i)
            .ok_or_else(|| ConnectorError::Internal(format!("Bad route template {}", template)))?;
        let placeholder = &rest[start + 1..end];
        let (name, greedy) = match placeholder.strip_suffix('+') {
            Some(name) => (name, true),
            None => (placeholder, false),
        };
        let value = params
            .remove(name)
            .as_ref()
            .and_then(scalar_string)
            .ok_or_else(|| {
                ConnectorError::InvalidRequest(format!("Missing required parameter {}", name))
            })?;
        path.push_str(&signer::uri_encode(&value, !greedy));
        rest = &rest[end + 1..];
    }
    path.push_str(rest);

    let query = flags
        .map(|flags| {
            flags
                .split('&')
                .filter(|f| !f.is_empty())
                .map(|f| match f.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (f.to_string(), String::new()),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok((path, query))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> AwsHttpClient {
        AwsHttpClient::new(AwsCredentials::new("AKID", "secret"), AwsClientOptions::default()).unwrap()
    }

    #[test]
    fn test_flatten_query_lists() {
        let mut out = Vec::new();
        flatten_query("AttributeNames", &json!(["All", "Policy"]), false, &mut out);
        assert_eq!(
            out,
            vec![
                ("AttributeNames.member.1".to_string(), "All".to_string()),
                ("AttributeNames.member.2".to_string(), "Policy".to_string()),
            ]
        );

        let mut out = Vec::new();
        flatten_query(
            "Filters",
            &json!([{"Name": "vpc-id", "Values": ["vpc-1"]}]),
            true,
            &mut out,
        );
        assert!(out.contains(&("Filter.1.Name".to_string(), "vpc-id".to_string())));
        assert!(out.contains(&("Filter.1.Value.1".to_string(), "vpc-1".to_string())));

        let mut out = Vec::new();
        flatten_query("InstanceIds", &json!(["i-1"]), true, &mut out);
        assert_eq!(out, vec![("InstanceId.1".to_string(), "i-1".to_string())]);
    }

    #[test]
    fn test_expand_route_consumes_params() {
        let mut params = json!({"clusterName": "prod", "nodegroupName": "ng a", "maxResults": 5})
            .as_object()
            .cloned()
            .unwrap();
        let (path, query) = expand_route(
            "/clusters/{clusterName}/node-groups/{nodegroupName}",
            &mut params,
        )
        .unwrap();
        assert_eq!(path, "/clusters/prod/node-groups/ng%20a");
        assert!(query.is_empty());
        assert_eq!(params.len(), 1);

        let mut params = json!({"Bucket": "logs"}).as_object().cloned().unwrap();
        let (path, query) = expand_route("/{Bucket}?encryption", &mut params).unwrap();
        assert_eq!(path, "/logs");
        assert_eq!(query, vec![("encryption".to_string(), String::new())]);

        let mut params = Map::new();
        assert!(matches!(
            expand_route("/jobs/{jobId}", &mut params),
            Err(ConnectorError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_greedy_placeholder_keeps_slashes() {
        let mut params = json!({"InsightArn": "arn:aws:securityhub:::insight/a/b"})
            .as_object()
            .cloned()
            .unwrap();
        let (path, _) = expand_route("/insights/results/{InsightArn+}", &mut params).unwrap();
        assert_eq!(path, "/insights/results/arn%3Aaws%3Asecurityhub%3A%3A%3Ainsight/a/b");
    }

    #[test]
    fn test_prepare_json_request() {
        let spec = catalog::service("dynamodb").unwrap();
        let prepared = client()
            .prepare(spec, "describe_table", &json!({"TableName": "t"}))
            .unwrap();
        assert!(prepared
            .headers
            .contains(&("x-amz-target".to_string(), "DynamoDB_20120810.DescribeTable".to_string())));
        assert_eq!(prepared.body, br#"{"TableName":"t"}"#.to_vec());
    }

    #[test]
    fn test_prepare_query_request_with_explicit_action() {
        let spec = catalog::service("rds").unwrap();
        let prepared = client()
            .prepare(spec, "DescribeDBClusters", &json!({}))
            .unwrap();
        assert_eq!(
            String::from_utf8(prepared.body).unwrap(),
            "Action=DescribeDBClusters&Version=2014-10-31"
        );
    }

    #[test]
    fn test_prepare_rest_request_uses_wire_query_keys() {
        let spec = catalog::service("guardduty").unwrap();
        let prepared = client()
            .prepare(spec, "list_detectors", &json!({"NextToken": "t1", "MaxResults": 50}))
            .unwrap();
        assert_eq!(prepared.path, "/detector");
        assert!(prepared.query.contains(&("nextToken".to_string(), "t1".to_string())));
        assert!(prepared.query.contains(&("maxResults".to_string(), "50".to_string())));
        assert!(!prepared.query.iter().any(|(k, _)| k == "NextToken"));

        let spec = catalog::service("resource-groups").unwrap();
        let prepared = client()
            .prepare(
                spec,
                "list_groups",
                &json!({"NextToken": "t2", "Filters": [{"Name": "resource-type"}]}),
            )
            .unwrap();
        assert_eq!(prepared.method, Method::POST);
        assert_eq!(prepared.query, vec![("nextToken".to_string(), "t2".to_string())]);
        let body: Value = serde_json::from_slice(&prepared.body).unwrap();
        assert!(body.get("NextToken").is_none());
        assert_eq!(body["Filters"][0]["Name"], "resource-type");
    }

    #[test]
    fn test_classify_error() {
        let json_body = r#"{"__type":"com.amazon.coral.service#AccessDeniedException","message":"no"}"#;
        assert!(matches!(
            classify_error("kms", "list_keys", StatusCode::BAD_REQUEST, json_body),
            ConnectorError::AuthorizationDenied(_)
        ));

        let xml_body = "<ErrorResponse><Error><Code>Throttling</Code><Message>slow</Message></Error></ErrorResponse>";
        assert!(matches!(
            classify_error("iam", "list_users", StatusCode::BAD_REQUEST, xml_body),
            ConnectorError::RateLimited(_)
        ));

        assert!(matches!(
            classify_error("s3", "get_bucket_website", StatusCode::NOT_FOUND, "<Error><Code>NoSuchWebsiteConfiguration</Code></Error>"),
            ConnectorError::NotFound(_)
        ));
    }
}
