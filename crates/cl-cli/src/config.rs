//! Configuration loading for the cloudits CLI.

use anyhow::{Context, Result};
use cl_connectors::{AwsClientOptions, SourcesConfig};
use cl_core::{AwsRunConfig, PathTemplates};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

static ENV_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env pattern"));

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Root of the evidence tree.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// File that mirrors the console log.
    #[serde(default)]
    pub log_file_path: Option<PathBuf>,

    /// Framework mapping document driving AWS collection.
    #[serde(default = "default_mapping_path")]
    pub framework_mapping_path: PathBuf,

    /// Environment label used for SaaS evidence paths.
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Collection tasks allowed to run at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Output path templates.
    #[serde(default)]
    pub paths: PathTemplates,

    /// AWS collection settings.
    #[serde(default)]
    pub aws: AwsSettings,

    /// SaaS sources.
    #[serde(default)]
    pub sources: SourcesConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingSettings,

    /// `${VAR}` references that were not set when the file was loaded.
    #[serde(skip)]
    pub unresolved_env: Vec<String>,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("evidence-artifacts")
}

fn default_mapping_path() -> PathBuf {
    PathBuf::from("framework_mapping/aws_with_frameworks.json")
}

fn default_environment() -> String {
    "commercial".to_string()
}

fn default_concurrency() -> usize {
    4
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            log_file_path: None,
            framework_mapping_path: default_mapping_path(),
            environment: default_environment(),
            concurrency: default_concurrency(),
            paths: PathTemplates::default(),
            aws: AwsSettings::default(),
            sources: SourcesConfig::default(),
            logging: LoggingSettings::default(),
            unresolved_env: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from a file, expanding `${VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parses a configuration document.
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let mut document: Value = serde_yaml::from_str(contents)?;
        if document.is_null() {
            return Ok(Self::default());
        }

        let mut unresolved = Vec::new();
        expand_env(&mut document, &mut unresolved);

        let mut config: Self = serde_yaml::from_value(document)?;
        unresolved.sort();
        unresolved.dedup();
        config.unresolved_env = unresolved;
        Ok(config)
    }

    /// Creates a copy with secrets redacted.
    pub fn redact_secrets(&self) -> Self {
        let mut config = self.clone();
        config.sources.redact_secrets();
        config
    }

    /// Collection settings for one AWS environment.
    pub fn aws_run_config(&self, environment: &str) -> Result<AwsRunConfig> {
        let settings = self.aws.environments.get(environment).with_context(|| {
            format!(
                "Unknown AWS environment '{}'. Configured: {}",
                environment,
                self.aws.environment_names().join(", ")
            )
        })?;

        Ok(AwsRunConfig {
            environment: environment.to_string(),
            regions: settings.regions.clone(),
            roles: self.aws.roles.clone(),
            evidence_collection_enabled: self.aws.evidence_collection_enabled.clone(),
            services: self.aws.services.clone(),
            max_pages: self.aws.max_pages,
            concurrency: self.concurrency,
        })
    }
}

/// AWS section of the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsSettings {
    /// Environment name → its regions and credentials.
    #[serde(default)]
    pub environments: BTreeMap<String, AwsEnvironment>,

    /// Role key → role ARN.
    #[serde(default)]
    pub roles: BTreeMap<String, String>,

    /// Role key → whether evidence is collected with it.
    #[serde(default)]
    pub evidence_collection_enabled: BTreeMap<String, bool>,

    /// Service → enabled.
    #[serde(default)]
    pub services: BTreeMap<String, bool>,

    /// Page limit per operation.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Retries for throttled or failed requests.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_pages() -> usize {
    100
}

fn default_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

impl Default for AwsSettings {
    fn default() -> Self {
        Self {
            environments: BTreeMap::new(),
            roles: BTreeMap::new(),
            evidence_collection_enabled: BTreeMap::new(),
            services: BTreeMap::new(),
            max_pages: default_max_pages(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl AwsSettings {
    pub fn environment_names(&self) -> Vec<&str> {
        self.environments.keys().map(String::as_str).collect()
    }

    pub fn client_options(&self) -> AwsClientOptions {
        AwsClientOptions {
            timeout: Duration::from_secs(self.timeout_secs),
            max_retries: self.max_retries,
            endpoint_override: None,
        }
    }
}

/// One AWS environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsEnvironment {
    #[serde(default)]
    pub regions: Vec<String>,

    /// Prefix of the `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` variables
    /// holding this environment's base credentials.
    #[serde(default)]
    pub credential_env_prefix: Option<String>,

    /// Region used for STS calls; defaults to the first region.
    #[serde(default)]
    pub default_region: Option<String>,
}

impl AwsEnvironment {
    pub fn sts_region(&self) -> Option<&str> {
        self.default_region
            .as_deref()
            .or_else(|| self.regions.first().map(String::as_str))
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Use JSON format.
    #[serde(default)]
    pub json_format: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

/// Replaces `${VAR}` in every string of the document with the variable's
/// value. Unset variables become empty and are reported in `unresolved`.
fn expand_env(value: &mut Value, unresolved: &mut Vec<String>) {
    match value {
        Value::String(s) if s.contains("${") => {
            let expanded = ENV_REFERENCE.replace_all(s, |caps: &regex::Captures| {
                let name = &caps[1];
                std::env::var(name).unwrap_or_else(|_| {
                    unresolved.push(name.to_string());
                    String::new()
                })
            });
            *s = expanded.into_owned();
        }
        Value::Sequence(items) => {
            for item in items {
                expand_env(item, unresolved);
            }
        }
        Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                expand_env(item, unresolved);
            }
        }
        Value::Tagged(tagged) => expand_env(&mut tagged.value, unresolved),
        _ => {}
    }
}

/// Default configuration path: the user's config directory, then `config/default.yaml`.
pub fn default_config_path() -> PathBuf {
    if let Some(dirs) = directories::ProjectDirs::from("com", "cloudits", "cloudits") {
        let user_config = dirs.config_dir().join("config.yaml");
        if user_config.exists() {
            return user_config;
        }
    }
    PathBuf::from("config/default.yaml")
}
