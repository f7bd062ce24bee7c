//! AWS evidence collection.
//!
//! For one environment the collector assumes every enabled audit role, then
//! walks the framework mapping in each region: resolve required parameters,
//! call the operation across all pages, drop empty results and write the
//! rest. Regions of all roles run concurrently up to a fixed limit. Any
//! failure is logged and recorded and the run carries on.

use crate::artifact::{check_meaningful, strip_metadata};
use crate::error::{CoreError, CoreResult};
use crate::ledger::{OperationRef, RunRecorder, RunSummary};
use crate::mapping::{FrameworkMapping, MappingEntry};
use crate::path::{AwsArtifactKey, OutputPathFormatter};
use crate::writer::EvidenceWriter;
use cl_connectors::cloud::aws::{account_id_from_arn, session_name};
use cl_connectors::{
    AwsApi, AwsApiFactory, CredentialProvider, Paginator, ParameterResolver, Resolution,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

/// What to collect for one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsRunConfig {
    pub environment: String,
    pub regions: Vec<String>,
    /// Role key → role ARN.
    pub roles: BTreeMap<String, String>,
    /// Role key → whether evidence is collected with it.
    pub evidence_collection_enabled: BTreeMap<String, bool>,
    /// Service → enabled. Services not listed are disabled.
    pub services: BTreeMap<String, bool>,
    pub max_pages: usize,
    /// Region tasks allowed to run at once.
    pub concurrency: usize,
}

impl AwsRunConfig {
    pub fn role_enabled(&self, role_key: &str) -> bool {
        self.evidence_collection_enabled
            .get(role_key)
            .copied()
            .unwrap_or(false)
    }

    pub fn service_enabled(&self, service: &str) -> bool {
        self.services.get(service).copied().unwrap_or(false)
    }
}

/// One role's view of an account.
struct RoleSession {
    role_key: String,
    account_id: String,
    api: Arc<dyn AwsApi>,
}

/// Collects AWS evidence for one environment.
pub struct AwsCollector {
    config: AwsRunConfig,
    credentials: Arc<dyn CredentialProvider>,
    factory: Arc<dyn AwsApiFactory>,
    resolver: ParameterResolver,
    mapping: FrameworkMapping,
    formatter: OutputPathFormatter,
    writer: EvidenceWriter,
}

impl AwsCollector {
    pub fn new(
        config: AwsRunConfig,
        credentials: Arc<dyn CredentialProvider>,
        factory: Arc<dyn AwsApiFactory>,
        mapping: FrameworkMapping,
        formatter: OutputPathFormatter,
    ) -> Self {
        Self {
            config,
            credentials,
            factory,
            resolver: ParameterResolver::default(),
            mapping,
            formatter,
            writer: EvidenceWriter::new(),
        }
    }

    /// Replaces the resolution table.
    pub fn with_resolver(mut self, resolver: ParameterResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &AwsRunConfig {
        &self.config
    }

    /// Runs the collection and writes the run manifest.
    pub async fn run(self: Arc<Self>, recorder: Arc<RunRecorder>) -> CoreResult<RunSummary> {
        if self.config.regions.is_empty() {
            return Err(CoreError::ConfigError(format!(
                "Environment '{}' has no regions",
                self.config.environment
            )));
        }
        recorder.run_started().await;

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (role_key, role_arn) in &self.config.roles {
            if !self.config.role_enabled(role_key) {
                info!("Skipping evidence collection for role: {}", role_key);
                continue;
            }
            info!("Starting evidence collection for role: {}", role_key);

            let Some(session) = self.open_session(role_key, role_arn, &recorder).await else {
                continue;
            };
            let session = Arc::new(session);

            for region in &self.config.regions {
                let collector = Arc::clone(&self);
                let recorder = Arc::clone(&recorder);
                let semaphore = Arc::clone(&semaphore);
                let session = Arc::clone(&session);
                let region = region.clone();
                let span = cl_observability::collection_span!(
                    self.config.environment,
                    session.role_key,
                    region
                );

                tasks.spawn(
                    async move {
                        let _permit = match semaphore.acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => {
                                warn!("Semaphore closed, aborting region collection");
                                return;
                            }
                        };
                        collector.collect_region(&session, &region, &recorder).await;
                    }
                    .instrument(span),
                );
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Region collection task failed: {}", e);
            }
        }

        recorder.finish(Some(&self.formatter), &self.writer).await
    }

    async fn open_session(
        &self,
        role_key: &str,
        role_arn: &str,
        recorder: &RunRecorder,
    ) -> Option<RoleSession> {
        let sts = || OperationRef::aws(role_key, "global", "sts", "assume_role");

        let credentials = match self
            .credentials
            .assume_role(role_arn, &session_name(role_key))
            .await
        {
            Ok(credentials) => credentials,
            Err(e) => {
                error!("Error assuming role {}: {}", role_arn, e);
                recorder.failed(sts(), &e.to_string()).await;
                return None;
            }
        };
        recorder.role_assumed(role_key, role_arn).await;

        let api = match self.factory.for_credentials(credentials) {
            Ok(api) => api,
            Err(e) => {
                error!("Error creating AWS client for role {}: {}", role_key, e);
                recorder.failed(sts(), &e.to_string()).await;
                return None;
            }
        };

        Some(RoleSession {
            role_key: role_key.to_string(),
            account_id: account_id_from_arn(role_arn).unwrap_or_default().to_string(),
            api,
        })
    }

    async fn collect_region(&self, session: &RoleSession, region: &str, recorder: &RunRecorder) {
        for entry in self.mapping.entries() {
            if !self.config.service_enabled(&entry.service) {
                debug!("Skipping disabled service: {}", entry.service);
                continue;
            }
            let op = OperationRef::aws(&session.role_key, region, &entry.service, &entry.function);
            if let Err(e) = self.collect_entry(session, region, entry, &op, recorder).await {
                error!(
                    "Error processing {} - {} in {}: {}",
                    entry.service, entry.function, region, e
                );
                recorder.failed(op, &e.to_string()).await;
            }
        }
    }

    async fn collect_entry(
        &self,
        session: &RoleSession,
        region: &str,
        entry: &MappingEntry,
        op: &OperationRef,
        recorder: &RunRecorder,
    ) -> CoreResult<()> {
        let api = session.api.as_ref();

        let resolution = match entry.resolution_rule() {
            Some(rule) => {
                self.resolver
                    .resolve_with(&rule, region, &session.account_id, api)
                    .await?
            }
            None => {
                self.resolver
                    .resolve(&entry.service, &entry.function, region, &session.account_id, api)
                    .await?
            }
        };

        let mut params = entry.parameters.clone();
        match resolution {
            Resolution::NotRequired => {}
            Resolution::Resolved(resolved) => params.extend(resolved),
            Resolution::Unresolvable(reason) => {
                info!(
                    "Required parameters unavailable for {} - {} in {}: {}. Skipping evidence creation.",
                    entry.service, entry.function, region, reason
                );
                recorder.skipped(op.clone(), "unresolvable").await;
                return Ok(());
            }
        }

        let started = Instant::now();
        let response = Paginator::new(api, self.config.max_pages)
            .call_all(&entry.service, entry.wire_operation(), region, &Value::Object(params))
            .await;
        recorder.record_duration(&entry.service, started.elapsed().as_secs_f64());
        let response = response?;

        if let Err(reason) = check_meaningful(&response, entry.result_key.as_deref()) {
            info!(
                "No meaningful data returned for {} - {} in {}. Skipping evidence creation.",
                entry.service, entry.function, region
            );
            recorder.skipped(op.clone(), reason.as_str()).await;
            return Ok(());
        }

        let path = self.formatter.aws_path(&AwsArtifactKey {
            environment: &self.config.environment,
            role: &session.role_key,
            region,
            service: &entry.service,
            operation: &entry.function,
        })?;
        let written = self
            .writer
            .write_json(&path, &strip_metadata(response))
            .await?;
        recorder
            .artifact(op.clone(), &written, Some(entry.frameworks.clone()))
            .await;
        Ok(())
    }
}
