//! Follows AWS continuation tokens and merges the pages.
//!
//! REST operations declare their token in the service catalog, since the
//! response field and the request member often differ (`NextMarker` goes
//! back as `Marker`). Other operations fall back to the common field names.

use super::catalog::{self, PageToken};
use super::client::AwsApi;
use crate::traits::ConnectorResult;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Response token field and the request parameter that carries it back.
const TOKENS: &[(&str, &str)] = &[
    ("NextToken", "NextToken"),
    ("nextToken", "nextToken"),
    ("NextContinuationToken", "ContinuationToken"),
    ("NextPageToken", "NextPageToken"),
    ("LastEvaluatedTableName", "ExclusiveStartTableName"),
    ("position", "position"),
    ("Marker", "Marker"),
];

/// Truncation flags; the merged result keeps the last page's value.
const FLAGS: &[&str] = &["IsTruncated", "Truncated"];

/// Drives an operation across pages, bounded by `max_pages`.
pub struct Paginator<'a> {
    api: &'a dyn AwsApi,
    max_pages: usize,
}

impl<'a> Paginator<'a> {
    pub fn new(api: &'a dyn AwsApi, max_pages: usize) -> Self {
        Self {
            api,
            max_pages: max_pages.max(1),
        }
    }

    /// Calls the operation until no continuation token remains.
    ///
    /// List fields are concatenated across pages; scalar fields keep the
    /// first page's value. Token fields are dropped from the result.
    pub async fn call_all(
        &self,
        service: &str,
        operation: &str,
        region: &str,
        params: &Value,
    ) -> ConnectorResult<Value> {
        let declared = catalog::service(service)
            .ok()
            .and_then(|spec| spec.page_token(operation));
        let mut request = params.as_object().cloned().unwrap_or_default();
        let mut merged: Option<Map<String, Value>> = None;
        let mut last_token: Option<String> = None;

        for page in 1..=self.max_pages {
            let response = self
                .api
                .call(service, operation, region, &Value::Object(request.clone()))
                .await?;
            let Value::Object(page_map) = response else {
                return Ok(response);
            };

            let next = next_token(service, declared, &page_map);
            match merged.as_mut() {
                None => merged = Some(page_map),
                Some(acc) => merge_page(acc, page_map, declared),
            }

            let Some((param, token)) = next else {
                break;
            };
            if last_token.as_deref() == Some(token.as_str()) {
                warn!(service, operation, "Continuation token repeated, stopping");
                break;
            }
            if page == self.max_pages {
                warn!(service, operation, max_pages = self.max_pages, "Page limit reached, output truncated");
                break;
            }
            debug!(service, operation, page, "Fetching next page");
            request.insert(param.to_string(), Value::String(token.clone()));
            last_token = Some(token);
        }

        let mut result = merged.unwrap_or_default();
        if let Some(token) = declared {
            result.remove(token.output);
        }
        for (field, _) in TOKENS {
            if *field != "Marker" || result.contains_key("IsTruncated") {
                result.remove(*field);
            }
        }
        result.remove("NextMarker");
        Ok(Value::Object(result))
    }
}

fn is_false(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => !b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("false"),
        _ => false,
    }
}

fn next_token(
    service: &str,
    declared: Option<PageToken>,
    page: &Map<String, Value>,
) -> Option<(&'static str, String)> {
    if FLAGS.iter().any(|flag| is_false(page.get(*flag))) {
        return None;
    }

    let token_of = |field: &str| {
        page.get(field)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    if let Some(token) = declared {
        return token_of(token.output).map(|t| (token.input, t));
    }

    if let Some(token) = token_of("NextMarker") {
        let param = if service.starts_with("waf") {
            "NextMarker"
        } else {
            "Marker"
        };
        return Some((param, token));
    }

    TOKENS
        .iter()
        .find_map(|(field, param)| token_of(field).map(|t| (*param, t)))
}

fn is_page_field(key: &str, declared: Option<PageToken>) -> bool {
    declared.is_some_and(|token| token.output == key)
        || TOKENS.iter().any(|(field, _)| *field == key)
        || FLAGS.contains(&key)
        || key == "NextMarker"
}

fn merge_page(acc: &mut Map<String, Value>, page: Map<String, Value>, declared: Option<PageToken>) {
    for (key, value) in page {
        match (acc.get_mut(&key), value) {
            (Some(Value::Array(existing)), Value::Array(more)) => existing.extend(more),
            (Some(existing), value) if is_page_field(&key, declared) => {
                *existing = value;
            }
            (Some(_), _) => {}
            (None, value) => {
                acc.insert(key, value);
            }
        }
    }
}
