//! Run ledger.
//!
//! A run ends by writing a manifest that lists every artifact with its
//! SHA-256 digest and every skipped or failed operation, so an auditor can
//! check the evidence tree against what the run claims to have produced.
//! [`RunRecorder`] is the single place collectors report outcomes to; it
//! feeds the ledger, the audit log and the metrics counters together.

use crate::error::CoreResult;
use crate::mapping::FrameworkRefs;
use crate::path::OutputPathFormatter;
use crate::writer::{ArtifactFormat, EvidenceWriter, WrittenArtifact};
use chrono::{DateTime, Utc};
use cl_observability::{AuditEventType, AuditResult, CollectionAuditLog, CollectionMetrics, RunTotals};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::path::PathBuf;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Identifies the provider call an outcome belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRef {
    /// `aws` or a SaaS platform name.
    pub platform: String,
    /// AWS service, or the SaaS platform again.
    pub service: String,
    /// AWS function or SaaS collector.
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl OperationRef {
    pub fn aws(role: &str, region: &str, service: &str, operation: &str) -> Self {
        Self {
            platform: "aws".to_string(),
            service: service.to_string(),
            operation: operation.to_string(),
            role: Some(role.to_string()),
            region: Some(region.to_string()),
        }
    }

    pub fn saas(platform: &str, collector: &str) -> Self {
        Self {
            platform: platform.to_string(),
            service: platform.to_string(),
            operation: collector.to_string(),
            role: None,
            region: None,
        }
    }

    /// Audit actor: the role for AWS, the platform otherwise.
    pub fn actor(&self) -> &str {
        self.role.as_deref().unwrap_or(&self.platform)
    }
}

impl fmt::Display for OperationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.operation)?;
        if let Some(region) = &self.region {
            write!(f, "@{}", region)?;
        }
        Ok(())
    }
}

/// A written artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub path: PathBuf,
    pub sha256: String,
    pub format: ArtifactFormat,
    #[serde(flatten)]
    pub source: OperationRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frameworks: Option<FrameworkRefs>,
}

/// An operation that produced nothing worth writing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipRecord {
    #[serde(flatten)]
    pub source: OperationRef,
    pub reason: String,
}

/// An operation that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    #[serde(flatten)]
    pub source: OperationRef,
    pub error: String,
}

/// Manifest of one collection run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLedger {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub environment: String,
    /// `aws` or `sources`.
    pub scope: String,
    pub artifacts: Vec<ArtifactRecord>,
    pub skipped: Vec<SkipRecord>,
    pub failures: Vec<FailureRecord>,
}

impl RunLedger {
    pub fn new(environment: &str, scope: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            environment: environment.to_string(),
            scope: scope.to_string(),
            artifacts: Vec::new(),
            skipped: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Sorts every list so manifests of equal runs compare equal.
    fn normalize(&mut self) {
        self.artifacts.sort_by(|a, b| a.path.cmp(&b.path));
        self.skipped
            .sort_by(|a, b| a.source.to_string().cmp(&b.source.to_string()));
        self.failures
            .sort_by(|a, b| a.source.to_string().cmp(&b.source.to_string()));
    }
}

/// Summary returned to the caller after a run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub ledger: RunLedger,
    pub manifest: Option<WrittenArtifact>,
    pub totals: RunTotals,
}

/// Collects outcomes from concurrent collection tasks.
pub struct RunRecorder {
    ledger: Mutex<RunLedger>,
    audit: CollectionAuditLog,
    metrics: CollectionMetrics,
}

impl RunRecorder {
    pub fn new(environment: &str, scope: &str) -> Self {
        Self::with_audit_log(environment, scope, CollectionAuditLog::default())
    }

    pub fn with_audit_log(environment: &str, scope: &str, audit: CollectionAuditLog) -> Self {
        Self {
            ledger: Mutex::new(RunLedger::new(environment, scope)),
            audit,
            metrics: CollectionMetrics::new(),
        }
    }

    pub async fn run_id(&self) -> Uuid {
        self.ledger.lock().await.run_id
    }

    pub fn audit(&self) -> &CollectionAuditLog {
        &self.audit
    }

    pub fn totals(&self) -> RunTotals {
        self.metrics.totals()
    }

    pub async fn run_started(&self) {
        let (run_id, environment, scope) = {
            let ledger = self.ledger.lock().await;
            (ledger.run_id, ledger.environment.clone(), ledger.scope.clone())
        };
        self.audit
            .log_event(
                AuditEventType::RunStarted,
                "system",
                &environment,
                &format!("Started {} collection", scope),
                json!({"run_id": run_id}),
                AuditResult::Success,
            )
            .await;
    }

    pub async fn role_assumed(&self, role: &str, role_arn: &str) {
        self.audit
            .log_event(
                AuditEventType::RoleAssumed,
                role,
                role_arn,
                "Assumed role",
                json!({}),
                AuditResult::Success,
            )
            .await;
    }

    pub async fn artifact(
        &self,
        source: OperationRef,
        written: &WrittenArtifact,
        frameworks: Option<FrameworkRefs>,
    ) {
        self.metrics
            .record_artifact_written(&source.platform, written.format.extension());
        self.audit
            .log_event(
                AuditEventType::ArtifactWritten,
                source.actor(),
                &source.to_string(),
                "Evidence written",
                json!({"path": written.path, "sha256": written.sha256}),
                AuditResult::Success,
            )
            .await;
        self.ledger.lock().await.artifacts.push(ArtifactRecord {
            path: written.path.clone(),
            sha256: written.sha256.clone(),
            format: written.format,
            source,
            frameworks,
        });
    }

    pub async fn skipped(&self, source: OperationRef, reason: &str) {
        self.metrics.record_skipped(&source.service, reason);
        self.audit
            .log_event(
                AuditEventType::OperationSkipped,
                source.actor(),
                &source.to_string(),
                "Skipped",
                json!({}),
                AuditResult::Skipped(reason.to_string()),
            )
            .await;
        self.ledger.lock().await.skipped.push(SkipRecord {
            source,
            reason: reason.to_string(),
        });
    }

    pub async fn failed(&self, source: OperationRef, error: &str) {
        self.metrics.record_failed(&source.service);
        self.audit
            .log_event(
                AuditEventType::OperationFailed,
                source.actor(),
                &source.to_string(),
                "Failed",
                json!({"error": error}),
                AuditResult::Failure(error.to_string()),
            )
            .await;
        self.ledger.lock().await.failures.push(FailureRecord {
            source,
            error: error.to_string(),
        });
    }

    pub fn record_duration(&self, service: &str, secs: f64) {
        self.metrics.record_duration(service, secs);
    }

    /// Closes the ledger and writes the manifest.
    ///
    /// When `formatter` is `None` nothing is written (dry runs and tests).
    pub async fn finish(
        &self,
        formatter: Option<&OutputPathFormatter>,
        writer: &EvidenceWriter,
    ) -> CoreResult<RunSummary> {
        let ledger = {
            let mut ledger = self.ledger.lock().await;
            ledger.finished_at = Some(Utc::now());
            ledger.normalize();
            ledger.clone()
        };

        let manifest = match formatter {
            Some(formatter) => {
                let path = formatter.manifest_path(&ledger.run_id.to_string())?;
                Some(writer.write_json(&path, &serde_json::to_value(&ledger)?).await?)
            }
            None => None,
        };

        let totals = self.totals();
        self.audit
            .log_event(
                AuditEventType::RunFinished,
                "system",
                &ledger.environment,
                "Finished collection",
                json!({
                    "run_id": ledger.run_id,
                    "artifacts": totals.artifacts_written,
                    "skipped": totals.operations_skipped,
                    "failed": totals.operations_failed,
                }),
                AuditResult::Success,
            )
            .await;

        Ok(RunSummary {
            ledger,
            manifest,
            totals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::CollectionClock;

    fn written(path: &str) -> WrittenArtifact {
        WrittenArtifact {
            path: PathBuf::from(path),
            sha256: "ab".repeat(32),
            bytes: 10,
            format: ArtifactFormat::Json,
        }
    }

    #[test]
    fn test_operation_ref_display() {
        let op = OperationRef::aws("audit", "us-east-1", "sqs", "list_queues");
        assert_eq!(op.to_string(), "sqs:list_queues@us-east-1");
        assert_eq!(op.actor(), "audit");
        let op = OperationRef::saas("okta", "mfa_enrollments");
        assert_eq!(op.to_string(), "okta:mfa_enrollments");
        assert_eq!(op.actor(), "okta");
    }

    #[tokio::test]
    async fn test_recorder_feeds_ledger_and_audit() {
        let recorder =
            RunRecorder::with_audit_log("commercial", "aws", CollectionAuditLog::without_tracing(100));
        recorder.run_started().await;
        recorder
            .artifact(
                OperationRef::aws("audit", "us-east-1", "kms", "list_keys"),
                &written("/e/b.json"),
                None,
            )
            .await;
        recorder
            .artifact(
                OperationRef::aws("audit", "us-east-1", "sqs", "list_queues"),
                &written("/e/a.json"),
                None,
            )
            .await;
        recorder
            .skipped(OperationRef::aws("audit", "us-east-1", "sqs", "get_queue_attributes"), "unresolvable")
            .await;
        recorder
            .failed(OperationRef::aws("audit", "us-east-1", "iam", "list_users"), "AccessDenied")
            .await;

        let summary = recorder.finish(None, &EvidenceWriter::new()).await.unwrap();
        assert_eq!(summary.ledger.artifacts.len(), 2);
        assert_eq!(summary.ledger.artifacts[0].path, PathBuf::from("/e/a.json"));
        assert_eq!(summary.ledger.skipped[0].reason, "unresolvable");
        assert_eq!(summary.ledger.failures[0].error, "AccessDenied");
        assert!(summary.ledger.finished_at.is_some());
        assert!(summary.manifest.is_none());
        assert_eq!(summary.totals.artifacts_written, 2);

        let entries = recorder.audit().get_entries().await;
        assert_eq!(entries.first().map(|e| &e.event_type), Some(&AuditEventType::RunStarted));
        assert_eq!(entries.last().map(|e| &e.event_type), Some(&AuditEventType::RunFinished));
        assert_eq!(recorder.audit().failures().await.len(), 1);
    }

    #[tokio::test]
    async fn test_manifest_written_under_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let formatter = OutputPathFormatter::new(dir.path(), CollectionClock::now());
        let recorder =
            RunRecorder::with_audit_log("federal", "aws", CollectionAuditLog::without_tracing(10));
        let run_id = recorder.run_id().await;

        let summary = recorder
            .finish(Some(&formatter), &EvidenceWriter::new())
            .await
            .unwrap();
        let manifest = summary.manifest.unwrap();
        assert!(manifest
            .path
            .ends_with(format!("run-{}.json", run_id)));
        assert!(manifest.path.starts_with(dir.path().join("manifests")));

        let parsed: RunLedger =
            serde_json::from_str(&std::fs::read_to_string(&manifest.path).unwrap()).unwrap();
        assert_eq!(parsed.run_id, run_id);
        assert_eq!(parsed.environment, "federal");
    }
}
