//! Framework mapping manifest.
//!
//! The mapping is a JSON array naming every AWS call to collect and the
//! SOC 2 / ISO 27001 clauses its output evidences:
//!
//! ```json
//! [
//!   {
//!     "service": "sqs",
//!     "function": "get_queue_attributes",
//!     "parameters": {"AttributeNames": ["All"]},
//!     "result_key": "Attributes",
//!     "frameworks": {"soc2": ["CC6.1"], "iso27001": ["A.8.24"]}
//!   }
//! ]
//! ```
//!
//! An entry may carry its own `resolve` rule, which takes precedence over
//! the built-in resolution table.

use crate::error::{CoreError, CoreResult};
use cl_connectors::cloud::aws::catalog;
use cl_connectors::ResolutionRule;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::{info, warn};

/// Compliance clauses an entry evidences.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkRefs {
    #[serde(default)]
    pub soc2: Vec<String>,
    #[serde(default)]
    pub iso27001: Vec<String>,
}

impl FrameworkRefs {
    pub fn is_empty(&self) -> bool {
        self.soc2.is_empty() && self.iso27001.is_empty()
    }
}

/// One AWS call in the mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub service: String,
    /// snake_case operation name.
    pub function: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Key whose emptiness means "nothing to record".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_key: Option<String>,
    /// Explicit PascalCase wire action, for names the derivation gets wrong.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default)]
    pub frameworks: FrameworkRefs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolve: Option<ResolutionRule>,
}

impl MappingEntry {
    /// Operation name sent to the API: the override if set, else `function`.
    pub fn wire_operation(&self) -> &str {
        self.action.as_deref().unwrap_or(&self.function)
    }

    /// The entry's own resolution rule with service and operation filled in.
    pub fn resolution_rule(&self) -> Option<ResolutionRule> {
        self.resolve.clone().map(|mut rule| {
            if rule.service.is_empty() {
                rule.service = self.service.clone();
            }
            if rule.operations.is_empty() {
                rule.operations = vec![self.function.clone()];
            }
            rule
        })
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.service, self.function)
    }
}

/// Problems found by [`FrameworkMapping::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MappingReport {
    pub duplicates: Vec<String>,
    pub unknown_services: Vec<String>,
    pub unmapped_frameworks: Vec<String>,
    pub skipped_entries: usize,
}

impl MappingReport {
    /// Duplicates and unknown services are errors; the rest are warnings.
    pub fn is_valid(&self) -> bool {
        self.duplicates.is_empty() && self.unknown_services.is_empty()
    }
}

/// The loaded mapping.
#[derive(Debug, Clone, Default)]
pub struct FrameworkMapping {
    entries: Vec<MappingEntry>,
    skipped: usize,
}

impl FrameworkMapping {
    pub fn new(entries: Vec<MappingEntry>) -> Self {
        Self { entries, skipped: 0 }
    }

    /// Loads a mapping file.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CoreError::io(path, e))?;
        let mapping = Self::from_json_str(&content)?;
        info!(
            path = %path.display(),
            entries = mapping.entries.len(),
            skipped = mapping.skipped,
            "Framework mapping loaded"
        );
        Ok(mapping)
    }

    /// Parses a mapping document.
    ///
    /// Entries without a service or function, or that fail to parse, are
    /// skipped with a warning rather than failing the whole mapping.
    pub fn from_json_str(content: &str) -> CoreResult<Self> {
        let raw: Vec<Value> = serde_json::from_str(content)
            .map_err(|e| CoreError::Mapping(format!("mapping must be a JSON array: {}", e)))?;

        let mut entries = Vec::with_capacity(raw.len());
        let mut skipped = 0;
        for item in raw {
            let has = |field: &str| {
                item.get(field)
                    .and_then(Value::as_str)
                    .is_some_and(|s| !s.trim().is_empty())
            };
            if !has("service") || !has("function") {
                warn!("Skipping due to missing service or function: {}", item);
                skipped += 1;
                continue;
            }
            match serde_json::from_value::<MappingEntry>(item.clone()) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed mapping entry: {}", item);
                    skipped += 1;
                }
            }
        }

        Ok(Self { entries, skipped })
    }

    pub fn entries(&self) -> &[MappingEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries dropped while loading.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Entries for one service.
    pub fn for_service<'a>(&'a self, service: &'a str) -> impl Iterator<Item = &'a MappingEntry> {
        self.entries.iter().filter(move |e| e.service == service)
    }

    pub fn find(&self, service: &str, function: &str) -> Option<&MappingEntry> {
        self.entries
            .iter()
            .find(|e| e.service == service && e.function == function)
    }

    /// Entry count per service.
    pub fn services(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.entries {
            *counts.entry(entry.service.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Rules carried by entries, for the parameter resolver.
    pub fn resolution_rules(&self) -> Vec<ResolutionRule> {
        self.entries
            .iter()
            .filter_map(MappingEntry::resolution_rule)
            .collect()
    }

    /// Reports duplicate entries, services the invoker cannot call, and
    /// entries without any framework clause.
    pub fn validate(&self) -> MappingReport {
        let mut report = MappingReport {
            skipped_entries: self.skipped,
            ..MappingReport::default()
        };
        let mut seen = HashSet::new();
        let mut unknown = HashSet::new();

        for entry in &self.entries {
            let key = entry.key();
            if !seen.insert(key.clone()) && !report.duplicates.contains(&key) {
                report.duplicates.push(key.clone());
            }
            if !catalog::is_known_service(&entry.service) && unknown.insert(entry.service.clone())
            {
                report.unknown_services.push(entry.service.clone());
            }
            if entry.frameworks.is_empty() {
                report.unmapped_frameworks.push(key);
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[
        {"service": "sqs", "function": "list_queues", "result_key": "QueueUrls",
         "frameworks": {"soc2": ["CC6.1"], "iso27001": ["A.8.24"]}},
        {"service": "sqs", "function": "get_queue_attributes",
         "parameters": {"AttributeNames": ["All"]},
         "frameworks": {"soc2": ["CC6.1"]}},
        {"service": "iam", "function": "list_open_id_connect_providers",
         "action": "ListOpenIDConnectProviders"},
        {"service": "", "function": "list_keys"},
        {"function": "describe_instances"},
        {"service": "kms", "function": "list_keys", "parameters": "not an object"}
    ]"#;

    #[test]
    fn test_load_skips_invalid_entries() {
        let mapping = FrameworkMapping::from_json_str(SAMPLE).unwrap();
        assert_eq!(mapping.len(), 3);
        assert_eq!(mapping.skipped(), 3);
        assert_eq!(mapping.services().get("sqs"), Some(&2));
    }

    #[test]
    fn test_not_an_array() {
        let err = FrameworkMapping::from_json_str(r#"{"service": "sqs"}"#).unwrap_err();
        assert!(matches!(err, CoreError::Mapping(_)));
    }

    #[test]
    fn test_wire_operation_override() {
        let mapping = FrameworkMapping::from_json_str(SAMPLE).unwrap();
        let entry = mapping
            .find("iam", "list_open_id_connect_providers")
            .unwrap();
        assert_eq!(entry.wire_operation(), "ListOpenIDConnectProviders");
        let entry = mapping.find("sqs", "list_queues").unwrap();
        assert_eq!(entry.wire_operation(), "list_queues");
    }

    #[test]
    fn test_validate_reports_problems() {
        let content = r#"[
            {"service": "sqs", "function": "list_queues", "frameworks": {"soc2": ["CC6.1"]}},
            {"service": "sqs", "function": "list_queues", "frameworks": {"soc2": ["CC6.1"]}},
            {"service": "sqs", "function": "list_queues", "frameworks": {"soc2": ["CC6.1"]}},
            {"service": "not-a-service", "function": "list_things"}
        ]"#;
        let report = FrameworkMapping::from_json_str(content).unwrap().validate();
        assert_eq!(report.duplicates, vec!["sqs:list_queues".to_string()]);
        assert_eq!(report.unknown_services, vec!["not-a-service".to_string()]);
        assert_eq!(report.unmapped_frameworks, vec!["not-a-service:list_things".to_string()]);
        assert!(!report.is_valid());
    }

    #[test]
    fn test_entry_resolution_rule_defaults() {
        let content = r#"[
            {"service": "kinesis", "function": "describe_stream",
             "resolve": {"steps": [{"operation": "list_streams",
                                    "binds": {"StreamName": "StreamNames/0"}}]}}
        ]"#;
        let mapping = FrameworkMapping::from_json_str(content).unwrap();
        let rules = mapping.resolution_rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].service, "kinesis");
        assert_eq!(rules[0].operations, vec!["describe_stream".to_string()]);
        assert!(rules[0].applies_to("kinesis", "describe_stream"));
    }
}
