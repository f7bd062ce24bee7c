//! SaaS collection against a scripted source.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use cl_connectors::{
    CollectionWindow, Connector, ConnectorError, ConnectorHealth, ConnectorResult, EvidenceItem,
    EvidenceSource, Platform,
};
use cl_core::{ArtifactFormat, CollectionClock, OutputPathFormatter, RunRecorder, SaasCollector};
use cl_observability::CollectionAuditLog;
use serde_json::json;
use std::path::Path;

struct ScriptedSource;

#[async_trait]
impl Connector for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn platform(&self) -> Platform {
        Platform::JumpCloud
    }

    async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
        Ok(ConnectorHealth::Healthy)
    }

    async fn test_connection(&self) -> ConnectorResult<bool> {
        Ok(true)
    }
}

#[async_trait]
impl EvidenceSource for ScriptedSource {
    fn collectors(&self) -> Vec<&'static str> {
        vec!["users", "password_policy", "empty", "broken", "app_users"]
    }

    async fn collect(
        &self,
        collector: &str,
        _window: &CollectionWindow,
    ) -> ConnectorResult<Vec<EvidenceItem>> {
        match collector {
            "users" => Ok(vec![EvidenceItem::tabular(
                "users",
                json!([
                    {"id": "u1", "email": "a@example.com", "mfa": {"configured": true}},
                    {"id": "u2", "email": "b@example.com"}
                ]),
                &["id", "email"],
            )]),
            "password_policy" => Ok(vec![
                EvidenceItem::json("password_policy", json!({"minLength": 14})),
                EvidenceItem::json("password_policy_extra", json!({})),
            ]),
            "empty" => Ok(Vec::new()),
            "app_users" => Ok(vec![
                EvidenceItem::json("app-Foo_Bar-users", json!([{"id": "u1"}])),
                EvidenceItem::json("app-Foo_Bar-users", json!([{"id": "u2"}])),
            ]),
            "broken" => Err(ConnectorError::RateLimited(60)),
            other => Err(ConnectorError::InvalidRequest(format!("no collector {}", other))),
        }
    }
}

fn collector(base: &Path) -> SaasCollector {
    let clock = CollectionClock::at(Utc.with_ymd_and_hms(2024, 3, 7, 10, 0, 0).unwrap());
    SaasCollector::new(
        "commercial",
        vec![Box::new(ScriptedSource)],
        clock.default_window(),
        OutputPathFormatter::new(base, clock),
    )
}

fn recorder() -> RunRecorder {
    RunRecorder::with_audit_log("commercial", "sources", CollectionAuditLog::without_tracing(100))
}

fn artifact(base: &Path, collector: &str, file: &str) -> std::path::PathBuf {
    base.join("identity_and_access/jumpcloud/commercial")
        .join(collector)
        .join("2024/3/2024-03-07")
        .join(file)
}

#[tokio::test]
async fn test_runs_every_collector() {
    let dir = tempfile::tempdir().unwrap();
    let summary = collector(dir.path()).run(&recorder(), &[]).await.unwrap();

    let csv = std::fs::read_to_string(artifact(dir.path(), "users", "users.csv")).unwrap();
    assert_eq!(csv, "id,email\nu1,a@example.com\nu2,b@example.com\n");
    assert!(artifact(dir.path(), "users", "users.json").exists());
    assert!(artifact(dir.path(), "password_policy", "password_policy.json").exists());
    assert!(!artifact(dir.path(), "password_policy", "password_policy_extra.json").exists());

    let first = artifact(dir.path(), "app_users", "app-Foo_Bar-users.json");
    let second = artifact(dir.path(), "app_users", "app-Foo_Bar-users-2.json");
    assert!(std::fs::read_to_string(first).unwrap().contains("u1"));
    assert!(std::fs::read_to_string(second).unwrap().contains("u2"));

    let ledger = &summary.ledger;
    assert_eq!(ledger.artifacts.len(), 5);
    assert_eq!(
        ledger
            .artifacts
            .iter()
            .filter(|a| a.format == ArtifactFormat::Csv)
            .count(),
        1
    );
    // The empty item and the collector with no items.
    assert_eq!(ledger.skipped.len(), 2);
    assert_eq!(ledger.failures.len(), 1);
    assert_eq!(ledger.failures[0].source.operation, "broken");
    assert_eq!(ledger.scope, "sources");
}

#[tokio::test]
async fn test_runs_selected_collectors_only() {
    let dir = tempfile::tempdir().unwrap();
    let summary = collector(dir.path())
        .run(&recorder(), &["password_policy".to_string(), "missing".to_string()])
        .await
        .unwrap();

    assert_eq!(summary.ledger.artifacts.len(), 1);
    assert!(!artifact(dir.path(), "users", "users.json").exists());
    assert_eq!(summary.ledger.failures.len(), 1);
    assert!(summary.ledger.failures[0].error.contains("missing"));
}

#[tokio::test]
async fn test_csv_rows_override_payload() {
    struct RowsSource;

    #[async_trait]
    impl Connector for RowsSource {
        fn name(&self) -> &str {
            "rows"
        }
        fn platform(&self) -> Platform {
            Platform::Jira
        }
        async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
            Ok(ConnectorHealth::Healthy)
        }
        async fn test_connection(&self) -> ConnectorResult<bool> {
            Ok(true)
        }
    }

    #[async_trait]
    impl EvidenceSource for RowsSource {
        fn collectors(&self) -> Vec<&'static str> {
            vec!["completed_tickets"]
        }
        async fn collect(
            &self,
            _collector: &str,
            _window: &CollectionWindow,
        ) -> ConnectorResult<Vec<EvidenceItem>> {
            Ok(vec![EvidenceItem::tabular(
                "platform-PLAT",
                json!([{"key": "PLAT-1", "fields": {"summary": "Rotate keys"}}]),
                &["key", "summary"],
            )
            .with_csv_rows(vec![json!({"key": "PLAT-1", "summary": "Rotate keys"})])])
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let clock = CollectionClock::at(Utc.with_ymd_and_hms(2024, 3, 7, 10, 0, 0).unwrap());
    let collector = SaasCollector::new(
        "commercial",
        vec![Box::new(RowsSource)],
        clock.default_window(),
        OutputPathFormatter::new(dir.path(), clock),
    );
    collector.run(&recorder(), &[]).await.unwrap();

    let csv = std::fs::read_to_string(
        dir.path()
            .join("ticketing/jira/commercial/completed_tickets/2024/3/2024-03-07/platform-PLAT.csv"),
    )
    .unwrap();
    assert_eq!(csv, "key,summary\nPLAT-1,Rotate keys\n");
}
