//! Configuration validation for cloudits.
//!
//! Checks the configuration, the framework mapping and the path templates
//! before a collection run so problems surface up front rather than as a
//! ledger full of failures.

use crate::config::AppConfig;
use cl_connectors::cloud::aws::{catalog, is_role_arn};
use cl_connectors::sources::validate_project_key;
use cl_connectors::Platform;
use cl_core::FrameworkMapping;
use colored::Colorize;
use once_cell::sync::Lazy;
use regex::Regex;

static REGION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z]{2}(-gov|-iso[a-z]?)?-[a-z]+-\d+$").expect("valid region pattern")
});

/// Environments with built-in credential variable names.
const BUILTIN_ENVIRONMENTS: &[&str] = &["commercial", "federal"];

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Problems that make a run pointless or unsafe.
    pub errors: Vec<String>,
    /// Problems that only narrow what a run collects.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Prints the validation result to the console.
    pub fn print(&self) {
        if !self.warnings.is_empty() {
            println!();
            println!("{}", "Configuration Warnings:".yellow().bold());
            for warning in &self.warnings {
                println!("  {} {}", "⚠".yellow(), warning);
            }
        }

        if !self.errors.is_empty() {
            println!();
            println!("{}", "Configuration Errors:".red().bold());
            for error in &self.errors {
                println!("  {} {}", "✗".red(), error);
            }
        }

        if self.errors.is_empty() && self.warnings.is_empty() {
            println!("  {} Configuration OK", "✓".green());
        }
    }
}

/// Validates application configuration before a run.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates the whole configuration, including the mapping file.
    pub fn validate(config: &AppConfig) -> ValidationResult {
        let mut result = ValidationResult::new();

        Self::validate_general(config, &mut result);
        Self::validate_environments(config, &mut result);
        Self::validate_roles(config, &mut result);
        Self::validate_services(config, &mut result);
        Self::validate_sources(config, &mut result);

        match FrameworkMapping::load(&config.framework_mapping_path) {
            Ok(mapping) => result.merge(Self::validate_mapping(config, &mapping)),
            Err(e) => result.add_error(format!(
                "Framework mapping {} could not be loaded: {}",
                config.framework_mapping_path.display(),
                e
            )),
        }

        result
    }

    fn validate_general(config: &AppConfig, result: &mut ValidationResult) {
        if config.base_dir.as_os_str().is_empty() {
            result.add_error("base_dir must not be empty");
        }
        if config.concurrency == 0 {
            result.add_error("concurrency must be at least 1");
        }
        if let Err(e) = config.paths.validate() {
            result.add_error(format!("Invalid path template: {}", e));
        }
        for name in &config.unresolved_env {
            result.add_warning(format!(
                "Environment variable {} is referenced but not set",
                name
            ));
        }
    }

    fn validate_environments(config: &AppConfig, result: &mut ValidationResult) {
        if config.aws.environments.is_empty() {
            result.add_warning("No AWS environments configured. AWS collection is unavailable.");
        }

        for (name, environment) in &config.aws.environments {
            if environment.regions.is_empty() {
                result.add_error(format!("AWS environment '{}' has no regions", name));
            }
            for region in &environment.regions {
                if !REGION.is_match(region) {
                    result.add_error(format!(
                        "AWS environment '{}' has a malformed region: {}",
                        name, region
                    ));
                }
            }
            if environment.credential_env_prefix.is_none()
                && !BUILTIN_ENVIRONMENTS.contains(&name.as_str())
            {
                result.add_error(format!(
                    "AWS environment '{}' needs credential_env_prefix (only {} have defaults)",
                    name,
                    BUILTIN_ENVIRONMENTS.join(" and ")
                ));
            }
        }

        if config.aws.max_pages == 0 {
            result.add_error("aws.max_pages must be at least 1");
        }
    }

    fn validate_roles(config: &AppConfig, result: &mut ValidationResult) {
        for (key, arn) in &config.aws.roles {
            if !is_role_arn(arn) {
                result.add_error(format!("Role '{}' has a malformed ARN: {}", key, arn));
            }
            if !config.aws.evidence_collection_enabled.contains_key(key) {
                result.add_warning(format!(
                    "Role '{}' has no evidence_collection_enabled entry and will be skipped",
                    key
                ));
            }
        }

        for (key, enabled) in &config.aws.evidence_collection_enabled {
            if *enabled && !config.aws.roles.contains_key(key) {
                result.add_error(format!("Role '{}' is enabled but has no ARN", key));
            }
        }

        if !config.aws.environments.is_empty()
            && !config.aws.evidence_collection_enabled.values().any(|e| *e)
        {
            result.add_warning("No AWS role is enabled for evidence collection");
        }
    }

    fn validate_services(config: &AppConfig, result: &mut ValidationResult) {
        for (service, enabled) in &config.aws.services {
            if *enabled && !catalog::is_known_service(service) {
                result.add_error(format!("Enabled service '{}' is not supported", service));
            }
        }
    }

    fn validate_sources(config: &AppConfig, result: &mut ValidationResult) {
        let sources = &config.sources;

        for platform in sources.enabled_platforms() {
            let Some(connector) = sources.connector(platform) else {
                continue;
            };
            if connector.auth.is_missing_secret() {
                result.add_error(format!("Source '{}' is enabled but has no credential", platform));
            }
            if connector.base_url.is_empty() {
                result.add_error(format!("Source '{}' has no base_url", platform));
            } else if !connector.base_url.starts_with("https://") {
                result.add_warning(format!(
                    "Source '{}' does not use HTTPS: {}",
                    platform, connector.base_url
                ));
            }
            if !connector.verify_tls {
                result.add_warning(format!(
                    "Source '{}' has TLS verification disabled",
                    platform
                ));
            }
        }

        if sources.is_enabled(Platform::GitHub) {
            if let Some(github) = sources.github.as_ref().map(|e| &e.config) {
                if github.private_key.is_empty() {
                    result.add_error("Source 'github' is enabled but has no private_key");
                }
                if github.org.is_empty() {
                    result.add_error("Source 'github' has no org");
                }
            }
        }

        if sources.is_enabled(Platform::Jira) {
            if let Some(jira) = sources.jira.as_ref().map(|e| &e.config) {
                if jira.project_groups.is_empty() {
                    result.add_warning("Source 'jira' has no project groups");
                }
                for group in &jira.project_groups {
                    for key in &group.project_keys {
                        if !validate_project_key(key) {
                            result.add_error(format!(
                                "Jira group '{}' has an invalid project key: {}",
                                group.name, key
                            ));
                        }
                    }
                }
            }
        }
    }

    /// Validates a loaded mapping against the configured services.
    pub fn validate_mapping(config: &AppConfig, mapping: &FrameworkMapping) -> ValidationResult {
        let mut result = ValidationResult::new();
        let report = mapping.validate();

        for key in &report.duplicates {
            result.add_error(format!("Duplicate mapping entry: {}", key));
        }
        for service in &report.unknown_services {
            result.add_error(format!("Mapping references unknown service: {}", service));
        }
        if !report.unmapped_frameworks.is_empty() {
            result.add_warning(format!(
                "{} mapping entries carry no framework references",
                report.unmapped_frameworks.len()
            ));
        }
        if report.skipped_entries > 0 {
            result.add_warning(format!(
                "{} malformed mapping entries were skipped",
                report.skipped_entries
            ));
        }

        for service in mapping.services().keys() {
            if !config.aws.services.contains_key(service) {
                result.add_warning(format!(
                    "Mapped service '{}' is not listed under aws.services and will not be collected",
                    service
                ));
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(yaml: &str) -> AppConfig {
        AppConfig::from_yaml_str(yaml).unwrap()
    }

    #[test]
    fn test_validation_result_operations() {
        let mut result = ValidationResult::new();
        assert!(!result.has_errors());
        assert!(!result.has_warnings());

        result.add_error("Test error");
        result.add_warning("Test warning");
        assert!(result.has_errors());
        assert!(result.has_warnings());

        let mut other = ValidationResult::new();
        other.add_error("Other error");
        result.merge(other);
        assert_eq!(result.errors.len(), 2);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_environment_checks() {
        let config = config(
            r#"
aws:
  environments:
    commercial:
      regions: [us-east-1, "US-EAST"]
    staging:
      regions: []
"#,
        );
        let mut result = ValidationResult::new();
        ConfigValidator::validate_environments(&config, &mut result);

        assert!(result.errors.iter().any(|e| e.contains("US-EAST")));
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("'staging' has no regions")));
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("'staging' needs credential_env_prefix")));
        assert!(!result.errors.iter().any(|e| e.contains("'commercial' needs")));
    }

    #[test]
    fn test_gov_regions_are_accepted() {
        assert!(REGION.is_match("us-gov-west-1"));
        assert!(REGION.is_match("ap-southeast-2"));
        assert!(!REGION.is_match("us-east"));
    }

    #[test]
    fn test_role_checks() {
        let config = config(
            r#"
aws:
  roles:
    audit: arn:aws:iam::123456789012:role/audit
    broken: not-an-arn
  evidence_collection_enabled:
    audit: true
    ghost: true
"#,
        );
        let mut result = ValidationResult::new();
        ConfigValidator::validate_roles(&config, &mut result);

        assert!(result.errors.iter().any(|e| e.contains("not-an-arn")));
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("'ghost' is enabled but has no ARN")));
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("'broken' has no evidence_collection_enabled")));
    }

    #[test]
    fn test_unknown_enabled_service() {
        let config = config("aws:\n  services:\n    sqs: true\n    quantum: true\n    legacy: false\n");
        let mut result = ValidationResult::new();
        ConfigValidator::validate_services(&config, &mut result);

        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("quantum"));
    }

    #[test]
    fn test_source_checks() {
        let config = config(
            r#"
sources:
  okta:
    enabled: true
    name: okta
    base_url: http://acme.okta.com
    auth: {type: scheme, scheme: SSWS, token: ""}
  jira:
    enabled: true
    name: jira
    base_url: https://acme.atlassian.net
    auth: {type: basic, username: auditor@acme.com, password: token}
    project_groups:
      - name: platform
        project_keys: [PLAT, "bad key"]
"#,
        );
        let mut result = ValidationResult::new();
        ConfigValidator::validate_sources(&config, &mut result);

        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("'okta' is enabled but has no credential")));
        assert!(result.warnings.iter().any(|w| w.contains("does not use HTTPS")));
        assert!(result.errors.iter().any(|e| e.contains("bad key")));
        assert!(!result.errors.iter().any(|e| e.contains("PLAT")));
    }

    #[test]
    fn test_mapping_checks() {
        let config = config("aws:\n  services:\n    sqs: true\n");
        let mapping = FrameworkMapping::from_json_str(
            r#"[
                {"service": "sqs", "function": "list_queues", "frameworks": {"soc2": ["CC6.1"]}},
                {"service": "sqs", "function": "list_queues"},
                {"service": "kms", "function": "list_keys", "frameworks": {"soc2": ["CC6.1"]}}
            ]"#,
        )
        .unwrap();
        let result = ConfigValidator::validate_mapping(&config, &mapping);

        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("Duplicate mapping entry")));
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("'kms' is not listed")));
    }

    #[test]
    fn test_shipped_mapping_is_clean() {
        let config = AppConfig::from_yaml_str(include_str!("../../../config/default.yaml")).unwrap();
        let mapping = FrameworkMapping::from_json_str(include_str!(
            "../../../framework_mapping/aws_with_frameworks.json"
        ))
        .unwrap();
        let result = ConfigValidator::validate_mapping(&config, &mapping);
        assert!(!result.has_errors(), "{:?}", result.errors);
        assert!(!result.has_warnings(), "{:?}", result.warnings);
    }

    #[test]
    fn test_missing_mapping_file_is_an_error() {
        let mut config = AppConfig::default();
        config.framework_mapping_path = "/nonexistent/mapping.json".into();
        let result = ConfigValidator::validate(&config);
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("could not be loaded")));
    }
}
