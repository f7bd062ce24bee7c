//! Collection metrics.
//!
//! Counters are emitted through the `metrics` facade; a recorder installed by
//! the embedding process decides where they go. [`CollectionMetrics`] also
//! keeps local totals so a run can print its own summary.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;

pub const ARTIFACTS_WRITTEN: &str = "cloudits_artifacts_written_total";
pub const OPERATIONS_SKIPPED: &str = "cloudits_operations_skipped_total";
pub const OPERATIONS_FAILED: &str = "cloudits_operations_failed_total";
pub const OPERATION_DURATION: &str = "cloudits_operation_duration_seconds";

static REGISTER: Once = Once::new();

/// Totals for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub artifacts_written: u64,
    pub operations_skipped: u64,
    pub operations_failed: u64,
}

/// Counts artifacts, skips and failures.
#[derive(Debug, Default)]
pub struct CollectionMetrics {
    written: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

impl CollectionMetrics {
    /// Creates a collector and registers metric descriptions once per process.
    pub fn new() -> Self {
        REGISTER.call_once(Self::register_metrics);
        Self::default()
    }

    fn register_metrics() {
        describe_counter!(ARTIFACTS_WRITTEN, "Total number of evidence artifacts written");
        describe_counter!(
            OPERATIONS_SKIPPED,
            "Total number of operations skipped (empty result or unresolvable parameters)"
        );
        describe_counter!(OPERATIONS_FAILED, "Total number of failed provider calls");
        describe_histogram!(OPERATION_DURATION, "Provider call duration including pagination");
    }

    /// Records an artifact written for a platform.
    pub fn record_artifact_written(&self, platform: &str, format: &str) {
        counter!(ARTIFACTS_WRITTEN, "platform" => platform.to_string(), "format" => format.to_string())
            .increment(1);
        self.written.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a skipped operation.
    pub fn record_skipped(&self, service: &str, reason: &str) {
        counter!(OPERATIONS_SKIPPED, "service" => service.to_string(), "reason" => reason.to_string())
            .increment(1);
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed operation.
    pub fn record_failed(&self, service: &str) {
        counter!(OPERATIONS_FAILED, "service" => service.to_string()).increment(1);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records how long an operation took.
    pub fn record_duration(&self, service: &str, duration_secs: f64) {
        histogram!(OPERATION_DURATION, "service" => service.to_string()).record(duration_secs);
    }

    /// Returns the totals seen so far.
    pub fn totals(&self) -> RunTotals {
        RunTotals {
            artifacts_written: self.written.load(Ordering::Relaxed),
            operations_skipped: self.skipped.load(Ordering::Relaxed),
            operations_failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_accumulate() {
        let metrics = CollectionMetrics::new();
        metrics.record_artifact_written("aws", "json");
        metrics.record_artifact_written("okta", "csv");
        metrics.record_skipped("sqs", "empty");
        metrics.record_failed("kms");
        metrics.record_duration("kms", 0.25);

        assert_eq!(
            metrics.totals(),
            RunTotals {
                artifacts_written: 2,
                operations_skipped: 1,
                operations_failed: 1,
            }
        );
    }

    #[test]
    fn test_new_collectors_start_at_zero() {
        let _ = CollectionMetrics::new();
        assert_eq!(CollectionMetrics::new().totals(), RunTotals::default());
    }
}
