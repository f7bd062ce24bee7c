//! AWS evidence plumbing: credentials, request signing, the service catalog,
//! the generic invoker and required-parameter resolution.

pub mod catalog;
pub mod client;
pub mod credentials;
pub mod paginator;
pub mod resolver;
pub mod signer;
pub mod xml;

pub use client::{
    AwsApi, AwsApiFactory, AwsClientOptions, AwsHttpClient, HttpApiFactory, SharedApiFactory,
};
pub use credentials::{
    account_id_from_arn, is_role_arn, session_name, AwsCredentials, CredentialProvider,
    EnvironmentCredentialSource, StsCredentialProvider,
};
pub use paginator::Paginator;
pub use resolver::{builtin_rules, LookupStep, ParameterResolver, Resolution, ResolutionRule};
