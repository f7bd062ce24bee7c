//! Audit trail of a collection run.
//!
//! Every role assumption, written artifact, skip and failure becomes an
//! [`AuditLogEntry`]. Entries are mirrored to tracing and kept in memory so
//! the run ledger and the CLI summary can be built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// An entry in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    /// Role key, platform or `system`.
    pub actor: String,
    /// What the event concerns, e.g. `sqs:get_queue_attributes@us-east-1`.
    pub subject: String,
    pub description: String,
    pub details: serde_json::Value,
    pub result: AuditResult,
}

/// Types of auditable events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    RunStarted,
    RunFinished,
    RoleAssumed,
    ArtifactWritten,
    OperationSkipped,
    OperationFailed,
    SourceCollected,
}

/// Result of an audited operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Skipped(String),
    Failure(String),
}

/// Audit log with bounded in-memory storage.
pub struct CollectionAuditLog {
    entries: Arc<RwLock<VecDeque<AuditLogEntry>>>,
    max_entries: usize,
    log_to_tracing: bool,
}

impl CollectionAuditLog {
    /// Creates a new audit log.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::with_capacity(max_entries.min(1024)))),
            max_entries,
            log_to_tracing: true,
        }
    }

    /// Creates an audit log without tracing output.
    pub fn without_tracing(max_entries: usize) -> Self {
        Self {
            log_to_tracing: false,
            ..Self::new(max_entries)
        }
    }

    /// Logs an audit entry.
    pub async fn log(&self, entry: AuditLogEntry) {
        if self.log_to_tracing {
            match &entry.result {
                AuditResult::Failure(reason) => warn!(
                    event_type = ?entry.event_type,
                    actor = %entry.actor,
                    subject = %entry.subject,
                    "Audit: {} ({})",
                    entry.description,
                    reason
                ),
                _ => info!(
                    event_type = ?entry.event_type,
                    actor = %entry.actor,
                    subject = %entry.subject,
                    result = ?entry.result,
                    "Audit: {}",
                    entry.description
                ),
            }
        }

        let mut entries = self.entries.write().await;
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Logs an event.
    pub async fn log_event(
        &self,
        event_type: AuditEventType,
        actor: &str,
        subject: &str,
        description: &str,
        details: serde_json::Value,
        result: AuditResult,
    ) {
        self.log(AuditLogEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            actor: actor.to_string(),
            subject: subject.to_string(),
            description: description.to_string(),
            details,
            result,
        })
        .await;
    }

    /// Gets all entries in insertion order.
    pub async fn get_entries(&self) -> Vec<AuditLogEntry> {
        self.entries.read().await.iter().cloned().collect()
    }

    /// Gets entries of one type.
    pub async fn get_entries_by_type(&self, event_type: AuditEventType) -> Vec<AuditLogEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Gets entries whose result is a failure.
    pub async fn failures(&self) -> Vec<AuditLogEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| matches!(e.result, AuditResult::Failure(_)))
            .cloned()
            .collect()
    }

    /// Exports entries as JSON.
    pub async fn export_json(&self) -> String {
        let entries = self.get_entries().await;
        serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_string())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for CollectionAuditLog {
    fn default() -> Self {
        Self::new(100_000)
    }
}
