//! SaaS evidence collection.
//!
//! Runs the collectors of each selected source and files every non-empty
//! [`EvidenceItem`] as JSON, plus CSV when the collector produced a tabular
//! rendition. Sources run concurrently; a source's collectors run one after
//! another so its rate limit is respected.

use crate::artifact::check_meaningful;
use crate::error::CoreResult;
use crate::ledger::{OperationRef, RunRecorder, RunSummary};
use crate::path::{OutputPathFormatter, SaasArtifactKey};
use crate::writer::{rows_of, ArtifactFormat, EvidenceWriter};
use cl_connectors::{CollectionWindow, EvidenceItem, EvidenceSource};
use futures::future::join_all;
use std::collections::HashSet;
use std::time::Instant;
use tracing::{error, info, warn, Instrument};

/// Collects evidence from SaaS sources.
pub struct SaasCollector {
    environment: String,
    sources: Vec<Box<dyn EvidenceSource>>,
    window: CollectionWindow,
    formatter: OutputPathFormatter,
    writer: EvidenceWriter,
}

impl SaasCollector {
    pub fn new(
        environment: &str,
        sources: Vec<Box<dyn EvidenceSource>>,
        window: CollectionWindow,
        formatter: OutputPathFormatter,
    ) -> Self {
        Self {
            environment: environment.to_string(),
            sources,
            window,
            formatter,
            writer: EvidenceWriter::new(),
        }
    }

    /// Runs the named collectors (all of them when `collectors` is empty)
    /// and writes the run manifest.
    pub async fn run(&self, recorder: &RunRecorder, collectors: &[String]) -> CoreResult<RunSummary> {
        recorder.run_started().await;

        join_all(
            self.sources
                .iter()
                .map(|source| self.collect_source(source.as_ref(), recorder, collectors)),
        )
        .await;

        recorder.finish(Some(&self.formatter), &self.writer).await
    }

    async fn collect_source(
        &self,
        source: &dyn EvidenceSource,
        recorder: &RunRecorder,
        selected: &[String],
    ) {
        let platform = source.platform().to_string();
        let names: Vec<String> = if selected.is_empty() {
            source.collectors().into_iter().map(String::from).collect()
        } else {
            selected.to_vec()
        };
        info!(platform = %platform, collectors = names.len(), "Collecting source");

        for collector in &names {
            let span = cl_observability::source_span!(platform, collector);
            self.collect_one(source, collector, recorder)
                .instrument(span)
                .await;
        }
    }

    async fn collect_one(&self, source: &dyn EvidenceSource, collector: &str, recorder: &RunRecorder) {
        let platform = source.platform().to_string();
        let op = OperationRef::saas(&platform, collector);

        let started = Instant::now();
        let result = source.collect(collector, &self.window).await;
        recorder.record_duration(&platform, started.elapsed().as_secs_f64());

        let items = match result {
            Ok(items) => items,
            Err(e) => {
                error!("Error collecting {} {}: {}", platform, collector, e);
                recorder.failed(op, &e.to_string()).await;
                return;
            }
        };
        if items.is_empty() {
            info!("No data returned for {} {}. Skipping.", platform, collector);
            recorder.skipped(op, "empty").await;
            return;
        }

        let mut seen = HashSet::new();
        for item in items {
            if let Err(reason) = check_meaningful(&item.payload, None) {
                info!(subject = %item.subject, "No data for {} {}. Skipping.", platform, collector);
                recorder.skipped(op.clone(), reason.as_str()).await;
                continue;
            }
            let subject = unique_subject(&mut seen, &item.subject);
            if subject != item.subject {
                warn!(
                    subject = %item.subject,
                    renamed = %subject,
                    "Duplicate subject from {} {}",
                    platform,
                    collector
                );
            }
            if let Err(e) = self
                .write_item(source, collector, &item, &subject, &op, recorder)
                .await
            {
                error!(subject = %item.subject, "Error writing {} {}: {}", platform, collector, e);
                recorder.failed(op.clone(), &e.to_string()).await;
            }
        }
    }

    async fn write_item(
        &self,
        source: &dyn EvidenceSource,
        collector: &str,
        item: &EvidenceItem,
        subject: &str,
        op: &OperationRef,
        recorder: &RunRecorder,
    ) -> CoreResult<()> {
        let key = |format: ArtifactFormat| SaasArtifactKey {
            platform: source.platform(),
            environment: &self.environment,
            collector,
            subject,
            ext: format.extension(),
        };

        let json_path = self.formatter.saas_path(&key(ArtifactFormat::Json))?;
        let written = self.writer.write_json(&json_path, &item.payload).await?;
        recorder.artifact(op.clone(), &written, None).await;

        if let Some(columns) = &item.csv_columns {
            let rows = item
                .csv_rows
                .clone()
                .unwrap_or_else(|| rows_of(&item.payload));
            let csv_path = self.formatter.saas_path(&key(ArtifactFormat::Csv))?;
            let written = self.writer.write_csv(&csv_path, &rows, columns).await?;
            recorder.artifact(op.clone(), &written, None).await;
        }
        Ok(())
    }
}

/// Suffixes a subject already written by this collector with `-2`, `-3`, ...
fn unique_subject(seen: &mut HashSet<String>, subject: &str) -> String {
    let mut candidate = subject.to_string();
    let mut n = 1;
    while !seen.insert(candidate.clone()) {
        n += 1;
        candidate = format!("{}-{}", subject, n);
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_subject() {
        let mut seen = HashSet::new();
        assert_eq!(unique_subject(&mut seen, "app-Foo_Bar-users"), "app-Foo_Bar-users");
        assert_eq!(unique_subject(&mut seen, "app-Foo_Bar-users"), "app-Foo_Bar-users-2");
        assert_eq!(unique_subject(&mut seen, "app-Foo_Bar-users"), "app-Foo_Bar-users-3");
        assert_eq!(unique_subject(&mut seen, "app-Slack-users"), "app-Slack-users");

        seen.clear();
        assert_eq!(unique_subject(&mut seen, "a-2"), "a-2");
        assert_eq!(unique_subject(&mut seen, "a"), "a");
        assert_eq!(unique_subject(&mut seen, "a"), "a-3");
    }
}
