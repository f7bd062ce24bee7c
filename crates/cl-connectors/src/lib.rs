//! # cl-connectors
//!
//! Provider connectors for cloudits.
//!
//! This crate holds everything that talks to a provider: the shared HTTP
//! client, AWS credentials and request signing, the AWS service catalog and
//! required-parameter resolution table, and the SaaS evidence sources.

pub mod cloud;
pub mod http;
pub mod secure_string;
pub mod sources;
pub mod testing;
pub mod traits;

pub use secure_string::SecureString;

// Re-export traits
pub use traits::{
    AuthConfig, CollectionWindow, Connector, ConnectorCategory, ConnectorConfig, ConnectorError,
    ConnectorHealth, ConnectorResult, EvidenceItem, EvidenceSource, Platform, REDACTED,
};

// Re-export AWS plumbing
pub use cloud::aws::{
    AwsApi, AwsApiFactory, AwsClientOptions, AwsCredentials, AwsHttpClient, CredentialProvider,
    EnvironmentCredentialSource, HttpApiFactory, ParameterResolver, Paginator, Resolution,
    ResolutionRule, SharedApiFactory, StsCredentialProvider,
};

// Re-export sources
pub use sources::{SourceEntry, SourcesConfig};
