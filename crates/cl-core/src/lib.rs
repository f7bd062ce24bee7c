//! # cl-core
//!
//! Evidence collection engine for cloudits.
//!
//! This crate turns provider responses into evidence artifacts: it fixes the
//! run's date, renders output paths, filters empty results, writes JSON and
//! CSV files, loads the framework mapping and drives the AWS and SaaS
//! collection runs, recording everything in a run ledger.

pub mod artifact;
pub mod aws_collector;
pub mod clock;
pub mod error;
pub mod ledger;
pub mod mapping;
pub mod path;
pub mod saas_collector;
pub mod writer;

pub use artifact::{check_meaningful, is_meaningful, strip_metadata, EmptyReason};
pub use aws_collector::{AwsCollector, AwsRunConfig};
pub use clock::CollectionClock;
pub use error::{CoreError, CoreResult};
pub use ledger::{OperationRef, RunLedger, RunRecorder, RunSummary};
pub use mapping::{FrameworkMapping, FrameworkRefs, MappingEntry, MappingReport};
pub use path::{AwsArtifactKey, OutputPathFormatter, PathTemplates, SaasArtifactKey};
pub use saas_collector::SaasCollector;
pub use writer::{ArtifactFormat, EvidenceWriter, WrittenArtifact};
