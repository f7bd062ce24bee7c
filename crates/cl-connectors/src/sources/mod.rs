//! SaaS evidence sources.
//!
//! Each platform has a `{Platform}Config` (the shared [`ConnectorConfig`]
//! flattened with platform settings) and a `{Platform}Source` implementing
//! [`EvidenceSource`]. [`SourcesConfig`] is the `sources:` section of the
//! application config and builds the enabled sources.
//!
//! [`ConnectorConfig`]: crate::traits::ConnectorConfig

pub mod elastic;
pub mod github;
pub mod jira;
pub mod jumpcloud;
pub mod okta;
pub mod sentinelone;

pub use elastic::{ElasticConfig, ElasticIndices, ElasticSource};
pub use github::{GitHubConfig, GitHubSource};
pub use jira::{validate_project_key, JiraConfig, JiraProjectGroup, JiraSource};
pub use jumpcloud::{JumpCloudConfig, JumpCloudSource};
pub use okta::{OktaConfig, OktaSource};
pub use sentinelone::{SentinelOneConfig, SentinelOneSource};

use crate::secure_string::SecureString;
use crate::traits::{ConnectorConfig, ConnectorResult, EvidenceSource, Platform, REDACTED};
use serde::{Deserialize, Serialize};

/// A source's settings plus its on/off switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEntry<T> {
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub config: T,
}

/// Settings for every SaaS platform; absent sections are treated as disabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub okta: Option<SourceEntry<OktaConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jumpcloud: Option<SourceEntry<JumpCloudConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentinelone: Option<SourceEntry<SentinelOneConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elastic: Option<SourceEntry<ElasticConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<SourceEntry<GitHubConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jira: Option<SourceEntry<JiraConfig>>,
}

fn enabled<T>(entry: &Option<SourceEntry<T>>) -> Option<&T> {
    entry.as_ref().filter(|e| e.enabled).map(|e| &e.config)
}

impl SourcesConfig {
    /// Connector settings of a platform, whether or not it is enabled.
    pub fn connector(&self, platform: Platform) -> Option<&ConnectorConfig> {
        match platform {
            Platform::Okta => self.okta.as_ref().map(|e| &e.config.connector),
            Platform::JumpCloud => self.jumpcloud.as_ref().map(|e| &e.config.connector),
            Platform::SentinelOne => self.sentinelone.as_ref().map(|e| &e.config.connector),
            Platform::Elastic => self.elastic.as_ref().map(|e| &e.config.connector),
            Platform::GitHub => self.github.as_ref().map(|e| &e.config.connector),
            Platform::Jira => self.jira.as_ref().map(|e| &e.config.connector),
            Platform::Aws => None,
        }
    }

    /// Replaces every credential with a redaction marker.
    pub fn redact_secrets(&mut self) {
        for platform in Platform::SAAS {
            if let Some(connector) = self.connector_mut(platform) {
                connector.auth.redact();
            }
        }
        if let Some(github) = self.github.as_mut() {
            if !github.config.private_key.is_empty() {
                github.config.private_key = SecureString::from(REDACTED);
            }
        }
    }

    fn connector_mut(&mut self, platform: Platform) -> Option<&mut ConnectorConfig> {
        match platform {
            Platform::Okta => self.okta.as_mut().map(|e| &mut e.config.connector),
            Platform::JumpCloud => self.jumpcloud.as_mut().map(|e| &mut e.config.connector),
            Platform::SentinelOne => self.sentinelone.as_mut().map(|e| &mut e.config.connector),
            Platform::Elastic => self.elastic.as_mut().map(|e| &mut e.config.connector),
            Platform::GitHub => self.github.as_mut().map(|e| &mut e.config.connector),
            Platform::Jira => self.jira.as_mut().map(|e| &mut e.config.connector),
            Platform::Aws => None,
        }
    }

    /// Returns true if the platform is configured and switched on.
    pub fn is_enabled(&self, platform: Platform) -> bool {
        match platform {
            Platform::Okta => enabled(&self.okta).is_some(),
            Platform::JumpCloud => enabled(&self.jumpcloud).is_some(),
            Platform::SentinelOne => enabled(&self.sentinelone).is_some(),
            Platform::Elastic => enabled(&self.elastic).is_some(),
            Platform::GitHub => enabled(&self.github).is_some(),
            Platform::Jira => enabled(&self.jira).is_some(),
            Platform::Aws => false,
        }
    }

    /// Enabled platforms in run order.
    pub fn enabled_platforms(&self) -> Vec<Platform> {
        Platform::SAAS
            .into_iter()
            .filter(|p| self.is_enabled(*p))
            .collect()
    }

    /// Builds the source for a platform, or `None` when it is not enabled.
    pub fn build(&self, platform: Platform) -> ConnectorResult<Option<Box<dyn EvidenceSource>>> {
        let source: Box<dyn EvidenceSource> = match platform {
            Platform::Okta => match enabled(&self.okta) {
                Some(c) => Box::new(OktaSource::new(c.clone())?),
                None => return Ok(None),
            },
            Platform::JumpCloud => match enabled(&self.jumpcloud) {
                Some(c) => Box::new(JumpCloudSource::new(c.clone())?),
                None => return Ok(None),
            },
            Platform::SentinelOne => match enabled(&self.sentinelone) {
                Some(c) => Box::new(SentinelOneSource::new(c.clone())?),
                None => return Ok(None),
            },
            Platform::Elastic => match enabled(&self.elastic) {
                Some(c) => Box::new(ElasticSource::new(c.clone())?),
                None => return Ok(None),
            },
            Platform::GitHub => match enabled(&self.github) {
                Some(c) => Box::new(GitHubSource::new(c.clone())?),
                None => return Ok(None),
            },
            Platform::Jira => match enabled(&self.jira) {
                Some(c) => Box::new(JiraSource::new(c.clone())?),
                None => return Ok(None),
            },
            Platform::Aws => return Ok(None),
        };
        Ok(Some(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sources_config_enablement() {
        let config: SourcesConfig = serde_json::from_value(json!({
            "okta": {
                "enabled": true,
                "name": "okta",
                "base_url": "https://acme.okta.com",
                "auth": {"type": "scheme", "scheme": "SSWS", "token": "t"}
            },
            "sentinelone": {
                "name": "s1",
                "base_url": "https://acme.sentinelone.net",
                "auth": {"type": "scheme", "scheme": "APIToken", "token": "t"}
            }
        }))
        .unwrap();

        assert!(config.is_enabled(Platform::Okta));
        assert!(!config.is_enabled(Platform::SentinelOne));
        assert!(config.connector(Platform::SentinelOne).is_some());
        assert_eq!(config.enabled_platforms(), vec![Platform::Okta]);
        assert!(config.build(Platform::Jira).unwrap().is_none());

        let okta = config.build(Platform::Okta).unwrap().unwrap();
        assert_eq!(okta.platform(), Platform::Okta);
        assert_eq!(okta.name(), "okta");
    }

    #[test]
    fn test_redact_secrets_covers_disabled_sources() {
        let mut config: SourcesConfig = serde_json::from_value(json!({
            "sentinelone": {
                "name": "s1",
                "base_url": "https://acme.sentinelone.net",
                "auth": {"type": "scheme", "scheme": "APIToken", "token": "live-token"}
            }
        }))
        .unwrap();
        config.redact_secrets();

        let rendered = serde_json::to_string(&config).unwrap();
        assert!(!rendered.contains("live-token"));
        assert!(rendered.contains(REDACTED));
    }
}
