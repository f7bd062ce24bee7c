//! End-to-end AWS collection against an in-memory API.

use chrono::{TimeZone, Utc};
use cl_connectors::testing::{FakeAwsApi, FakeCredentialProvider};
use cl_connectors::{ConnectorError, SharedApiFactory};
use cl_core::{
    AwsCollector, AwsRunConfig, CollectionClock, CoreError, FrameworkMapping, OutputPathFormatter,
    RunRecorder,
};
use cl_observability::CollectionAuditLog;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const AUDIT_ARN: &str = "arn:aws:iam::123456789012:role/audit";
const BILLING_ARN: &str = "arn:aws:iam::123456789012:role/billing";
const SECURITY_ARN: &str = "arn:aws:iam::123456789012:role/security";

const MAPPING: &str = r#"[
    {"service": "sqs", "function": "list_queues", "result_key": "QueueUrls",
     "frameworks": {"soc2": ["CC6.1"], "iso27001": ["A.8.24"]}},
    {"service": "sqs", "function": "get_queue_attributes",
     "parameters": {"AttributeNames": ["All"]},
     "frameworks": {"soc2": ["CC6.1"]}},
    {"service": "sns", "function": "get_topic_attributes",
     "resolve": {"steps": [{"operation": "list_topics",
                            "binds": {"TopicArn": "Topics/1/TopicArn"}}]}},
    {"service": "kms", "function": "list_keys", "result_key": "Keys"},
    {"service": "iam", "function": "list_users"},
    {"service": "ec2", "function": "describe_instances"}
]"#;

fn run_config(regions: &[&str]) -> AwsRunConfig {
    AwsRunConfig {
        environment: "commercial".to_string(),
        regions: regions.iter().map(|r| r.to_string()).collect(),
        roles: BTreeMap::from([
            ("audit".to_string(), AUDIT_ARN.to_string()),
            ("billing".to_string(), BILLING_ARN.to_string()),
            ("security".to_string(), SECURITY_ARN.to_string()),
        ]),
        evidence_collection_enabled: BTreeMap::from([
            ("audit".to_string(), true),
            ("billing".to_string(), true),
            ("security".to_string(), false),
        ]),
        services: BTreeMap::from([
            ("sqs".to_string(), true),
            ("sns".to_string(), true),
            ("kms".to_string(), true),
            ("iam".to_string(), true),
            ("ec2".to_string(), false),
        ]),
        max_pages: 5,
        concurrency: 2,
    }
}

fn fake_api() -> FakeAwsApi {
    FakeAwsApi::new()
        .respond(
            "sqs",
            "list_queues",
            json!({
                "QueueUrls": ["https://sqs.us-east-1.amazonaws.com/123456789012/audit"],
                "ResponseMetadata": {"RequestId": "r1"}
            }),
        )
        .respond(
            "sqs",
            "get_queue_attributes",
            json!({"Attributes": {"KmsMasterKeyId": "alias/aws/sqs"}}),
        )
        .respond(
            "sns",
            "list_topics",
            json!({"Topics": [{"TopicArn": "arn:aws:sns:::first"}, {"TopicArn": "arn:aws:sns:::second"}]}),
        )
        .respond("sns", "get_topic_attributes", json!({"Attributes": {"Owner": "123456789012"}}))
        .respond("kms", "list_keys", json!({"Keys": [], "ResponseMetadata": {}}))
        .fail(
            "iam",
            "list_users",
            ConnectorError::AuthorizationDenied("iam:ListUsers".to_string()),
        )
}

fn formatter(base: &Path) -> OutputPathFormatter {
    let clock = CollectionClock::at(Utc.with_ymd_and_hms(2024, 3, 7, 10, 0, 0).unwrap());
    OutputPathFormatter::new(base, clock)
}

fn artifact_path(base: &Path, region: &str, file: &str) -> PathBuf {
    base.join("systems/aws/commercial/audit")
        .join(region)
        .join("2024/3/2024-03-07")
        .join(file)
}

fn recorder() -> Arc<RunRecorder> {
    Arc::new(RunRecorder::with_audit_log(
        "commercial",
        "aws",
        CollectionAuditLog::without_tracing(1_000),
    ))
}

#[tokio::test]
async fn test_collects_enabled_roles_and_services() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(fake_api());
    let credentials = Arc::new(FakeCredentialProvider::new().deny(BILLING_ARN));

    let collector = Arc::new(AwsCollector::new(
        run_config(&["us-east-1", "us-west-2"]),
        credentials.clone(),
        Arc::new(SharedApiFactory(api.clone())),
        FrameworkMapping::from_json_str(MAPPING).unwrap(),
        formatter(dir.path()),
    ));
    let summary = collector.run(recorder()).await.unwrap();

    // Only the enabled, assumable role produced evidence.
    assert_eq!(credentials.assumed(), vec![AUDIT_ARN.to_string()]);

    for region in ["us-east-1", "us-west-2"] {
        for file in [
            "sqs-list_queues.json",
            "sqs-get_queue_attributes.json",
            "sns-get_topic_attributes.json",
        ] {
            assert!(
                artifact_path(dir.path(), region, file).exists(),
                "missing {} in {}",
                file,
                region
            );
        }
        assert!(!artifact_path(dir.path(), region, "kms-list_keys.json").exists());
    }
    assert_eq!(summary.ledger.artifacts.len(), 6);
    assert_eq!(summary.totals.artifacts_written, 6);

    // Metadata is stripped before writing.
    let written: Value = serde_json::from_str(
        &std::fs::read_to_string(artifact_path(dir.path(), "us-east-1", "sqs-list_queues.json"))
            .unwrap(),
    )
    .unwrap();
    assert!(written.get("ResponseMetadata").is_none());
    assert_eq!(written["QueueUrls"].as_array().map(Vec::len), Some(1));

    // Frameworks travel into the ledger.
    let record = summary
        .ledger
        .artifacts
        .iter()
        .find(|a| a.source.operation == "list_queues")
        .unwrap();
    assert_eq!(
        record.frameworks.as_ref().map(|f| f.soc2.clone()),
        Some(vec!["CC6.1".to_string()])
    );

    // Empty result key is a skip; the denied call and the denied role are failures.
    assert_eq!(summary.ledger.skipped.len(), 2);
    assert!(summary
        .ledger
        .skipped
        .iter()
        .all(|s| s.source.service == "kms" && s.reason == "empty_result_key"));
    assert_eq!(summary.ledger.failures.len(), 3);
    assert!(summary
        .ledger
        .failures
        .iter()
        .any(|f| f.source.role.as_deref() == Some("billing") && f.source.service == "sts"));

    // Disabled services are never called.
    assert!(api.calls_to("ec2", "describe_instances").is_empty());

    // The manifest is written.
    assert!(summary.manifest.unwrap().path.exists());
}

#[tokio::test]
async fn test_resolved_parameters_merge_over_static_ones() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(fake_api());

    let collector = Arc::new(AwsCollector::new(
        run_config(&["us-east-1"]),
        Arc::new(FakeCredentialProvider::new()),
        Arc::new(SharedApiFactory(api.clone())),
        FrameworkMapping::from_json_str(MAPPING).unwrap(),
        formatter(dir.path()),
    ));
    collector.run(recorder()).await.unwrap();

    let calls = api.calls_to("sqs", "get_queue_attributes");
    assert!(!calls.is_empty());
    assert_eq!(
        calls[0].params,
        json!({
            "AttributeNames": ["All"],
            "QueueUrl": "https://sqs.us-east-1.amazonaws.com/123456789012/audit"
        })
    );

    // The entry's own rule wins over the built-in table.
    let calls = api.calls_to("sns", "get_topic_attributes");
    assert_eq!(calls[0].params, json!({"TopicArn": "arn:aws:sns:::second"}));
}

#[tokio::test]
async fn test_unresolvable_parameters_skip_the_operation() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(FakeAwsApi::new().respond("sqs", "list_queues", json!({})));
    let mapping = FrameworkMapping::from_json_str(
        r#"[{"service": "sqs", "function": "get_queue_attributes"}]"#,
    )
    .unwrap();

    let collector = Arc::new(AwsCollector::new(
        run_config(&["us-east-1"]),
        Arc::new(FakeCredentialProvider::new()),
        Arc::new(SharedApiFactory(api.clone())),
        mapping,
        formatter(dir.path()),
    ));
    let summary = collector.run(recorder()).await.unwrap();

    assert!(summary.ledger.artifacts.is_empty());
    assert!(summary.ledger.failures.is_empty());
    // One skip per enabled role.
    assert_eq!(summary.ledger.skipped.len(), 2);
    assert!(summary
        .ledger
        .skipped
        .iter()
        .all(|s| s.reason == "unresolvable"));
    assert!(api.calls_to("sqs", "get_queue_attributes").is_empty());
}

#[tokio::test]
async fn test_environment_without_regions_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let collector = Arc::new(AwsCollector::new(
        run_config(&[]),
        Arc::new(FakeCredentialProvider::new()),
        Arc::new(SharedApiFactory(Arc::new(FakeAwsApi::new()))),
        FrameworkMapping::default(),
        formatter(dir.path()),
    ));
    let err = collector.run(recorder()).await.unwrap_err();
    assert!(matches!(err, CoreError::ConfigError(_)));
}
