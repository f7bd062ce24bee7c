//! Empty-result filtering.
//!
//! A response is only worth filing as evidence if it says something beyond
//! request metadata. These checks decide that before anything touches disk.

use serde_json::Value;

/// Key AWS attaches to every response; it is never evidence.
pub const RESPONSE_METADATA: &str = "ResponseMetadata";

/// Reason an artifact was not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyReason {
    /// `null`, `[]`, `{}` or `""`.
    Empty,
    /// Only `ResponseMetadata` remained.
    MetadataOnly,
    /// The mapping's `result_key` was missing or empty.
    EmptyResultKey,
}

impl EmptyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmptyReason::Empty => "empty",
            EmptyReason::MetadataOnly => "metadata_only",
            EmptyReason::EmptyResultKey => "empty_result_key",
        }
    }
}

/// Classifies a response; `Ok(())` means it should be written.
pub fn check_meaningful(value: &Value, result_key: Option<&str>) -> Result<(), EmptyReason> {
    if is_empty_value(value) {
        return Err(EmptyReason::Empty);
    }
    if let Value::Object(map) = value {
        if map.keys().all(|k| k == RESPONSE_METADATA) {
            return Err(EmptyReason::MetadataOnly);
        }
        if let Some(key) = result_key.filter(|k| !k.is_empty()) {
            match map.get(key) {
                Some(inner) if !is_empty_value(inner) => {}
                _ => return Err(EmptyReason::EmptyResultKey),
            }
        }
    }
    Ok(())
}

/// Returns true when a response should be written as evidence.
pub fn is_meaningful(value: &Value, result_key: Option<&str>) -> bool {
    check_meaningful(value, result_key).is_ok()
}

/// Removes `ResponseMetadata` from a top-level object.
pub fn strip_metadata(mut value: Value) -> Value {
    if let Value::Object(map) = &mut value {
        map.remove(RESPONSE_METADATA);
    }
    value
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
