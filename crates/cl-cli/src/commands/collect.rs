//! Collect commands - run an AWS or SaaS evidence collection.

use anyhow::{bail, Context, Result};
use cl_connectors::{
    EnvironmentCredentialSource, EvidenceSource, HttpApiFactory, Platform, StsCredentialProvider,
};
use cl_core::{
    AwsCollector, CollectionClock, FrameworkMapping, OutputPathFormatter, RunRecorder, RunSummary,
    SaasCollector,
};
use colored::Colorize;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::config::AppConfig;

/// Which SaaS sources a run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSelection {
    All,
    One(Platform),
}

impl FromStr for SourceSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(SourceSelection::All);
        }
        match Platform::from_str(s) {
            Ok(Platform::Aws) => Err("Use `collect aws` for AWS".to_string()),
            Ok(platform) => Ok(SourceSelection::One(platform)),
            Err(e) => Err(e.to_string()),
        }
    }
}

fn formatter(config: &AppConfig, clock: CollectionClock) -> Result<OutputPathFormatter> {
    OutputPathFormatter::new(&config.base_dir, clock)
        .with_templates(config.paths.clone())
        .context("Invalid path templates")
}

/// Collects AWS evidence for one environment.
pub async fn collect_aws(config: &AppConfig, environment: &str) -> Result<RunSummary> {
    let run_config = config.aws_run_config(environment)?;
    let settings = config
        .aws
        .environments
        .get(environment)
        .with_context(|| format!("Unknown AWS environment '{}'", environment))?;

    let source = match &settings.credential_env_prefix {
        Some(prefix) => {
            let region = settings
                .sts_region()
                .with_context(|| format!("Environment '{}' has no regions", environment))?;
            EnvironmentCredentialSource::with_prefix(environment, prefix, region)
        }
        None => EnvironmentCredentialSource::for_environment(environment)?,
    };
    let credentials = Arc::new(StsCredentialProvider::new(source).await);

    let mapping = FrameworkMapping::load(&config.framework_mapping_path).with_context(|| {
        format!(
            "Failed to load framework mapping: {}",
            config.framework_mapping_path.display()
        )
    })?;

    let clock = CollectionClock::now();
    info!(
        environment = %environment,
        date = %clock.end_date(),
        regions = run_config.regions.len(),
        "Starting AWS evidence collection"
    );

    let collector = Arc::new(AwsCollector::new(
        run_config,
        credentials,
        Arc::new(HttpApiFactory {
            options: config.aws.client_options(),
        }),
        mapping,
        formatter(config, clock)?,
    ));
    let recorder = Arc::new(RunRecorder::new(environment, "aws"));

    Ok(collector.run(recorder).await?)
}

/// Collects evidence from the selected SaaS sources.
///
/// `days` overrides the default window, which starts on the same day of the
/// previous month.
pub async fn collect_sources(
    config: &AppConfig,
    selection: &SourceSelection,
    collectors: &[String],
    days: Option<i64>,
) -> Result<RunSummary> {
    let platforms = match selection {
        SourceSelection::All => config.sources.enabled_platforms(),
        SourceSelection::One(platform) => vec![*platform],
    };
    if platforms.is_empty() {
        bail!("No SaaS sources are enabled");
    }
    if !collectors.is_empty() && platforms.len() > 1 {
        bail!("--collector requires a single source");
    }

    let mut sources: Vec<Box<dyn EvidenceSource>> = Vec::with_capacity(platforms.len());
    for platform in platforms {
        match config.sources.build(platform)? {
            Some(source) => sources.push(source),
            None => bail!("Source '{}' is not enabled", platform),
        }
    }

    let clock = CollectionClock::now();
    let window = match days {
        Some(days) => clock.window(days),
        None => clock.default_window(),
    };
    info!(
        sources = sources.len(),
        start = %window.start,
        end = %window.end,
        "Starting SaaS evidence collection"
    );

    let collector = SaasCollector::new(
        &config.environment,
        sources,
        window,
        formatter(config, clock)?,
    );
    let recorder = RunRecorder::new(&config.environment, "sources");

    Ok(collector.run(&recorder, collectors).await?)
}

/// Prints a run summary to the console.
pub fn print_summary(summary: &RunSummary, verbose: bool) {
    let ledger = &summary.ledger;

    println!();
    println!("{}", "Collection Summary".bold());
    println!("──────────────────");
    println!("  Run: {}", ledger.run_id.to_string().cyan());
    println!("  Environment: {}", ledger.environment);
    println!(
        "  Artifacts written: {}",
        summary.totals.artifacts_written.to_string().green()
    );
    println!("  Skipped: {}", summary.totals.operations_skipped);

    let failed = summary.totals.operations_failed.to_string();
    if summary.totals.operations_failed > 0 {
        println!("  Failed: {}", failed.red());
    } else {
        println!("  Failed: {}", failed);
    }

    if let Some(manifest) = &summary.manifest {
        println!("  Manifest: {}", manifest.path.display());
    }

    if verbose {
        for skip in &ledger.skipped {
            println!("  {} {} ({})", "-".yellow(), skip.source, skip.reason);
        }
    }
    if !ledger.failures.is_empty() {
        println!();
        println!("{}", "Failures:".red().bold());
        for failure in &ledger.failures {
            let actor = failure.source.role.as_deref().unwrap_or("");
            println!(
                "  {} {} {} {}",
                "✗".red(),
                actor,
                failure.source,
                failure.error
            );
        }
    }
}
