//! cloudits CLI
//!
//! Command-line interface for the cloudits compliance evidence collector.

use anyhow::Result;
use clap::{Parser, Subcommand};
use cl_connectors::{ConnectorHealth, Platform};
use cl_core::{FrameworkMapping, RunSummary};
use cl_observability::logging::LoggingConfig;
use colored::Colorize;
use serde_json::json;
use std::path::PathBuf;
use std::str::FromStr;

mod commands;
mod config;
mod validator;

use commands::{collect_aws, collect_sources, print_summary, SourceSelection};
use config::{default_config_path, AppConfig};
use validator::ConfigValidator;

/// Exit code of a run that completed with failed operations.
const EXIT_PARTIAL: i32 = 2;

#[derive(Parser)]
#[command(name = "cloudits")]
#[command(author = "Cloudits Team")]
#[command(version)]
#[command(about = "Compliance evidence collection for AWS and SaaS platforms", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(long, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid output format: {}", s)),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Collect evidence
    Collect {
        #[command(subcommand)]
        target: CollectCommands,
    },

    /// Validate configuration and the framework mapping
    Validate {
        /// Configuration file to validate
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show current configuration
    Config {
        /// Show secrets (redacted by default)
        #[arg(long)]
        show_secrets: bool,
    },

    /// Manage SaaS sources
    Sources {
        #[command(subcommand)]
        action: SourceCommands,
    },

    /// Inspect the framework mapping
    Mapping {
        #[command(subcommand)]
        action: MappingCommands,
    },
}

#[derive(Subcommand)]
enum CollectCommands {
    /// Collect AWS evidence for one environment
    Aws {
        /// Environment name (commercial, federal, ...)
        environment: String,
    },

    /// Collect evidence from SaaS sources
    Source {
        /// Source name, or `all` for every enabled source
        name: SourceSelection,

        /// Run only these collectors (repeatable)
        #[arg(long = "collector", value_name = "NAME")]
        collectors: Vec<String>,

        /// Look back this many days instead of one month
        #[arg(long)]
        days: Option<i64>,
    },
}

#[derive(Subcommand)]
enum SourceCommands {
    /// List configured sources and their collectors
    List,

    /// Check connectivity and credentials of a source
    Test {
        /// Source name
        name: String,
    },
}

#[derive(Subcommand)]
enum MappingCommands {
    /// List mapped operations
    List {
        /// Only show this service
        #[arg(long)]
        service: Option<String>,
    },

    /// Check the mapping for duplicates and unsupported services
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = AppConfig::load(&config_path).unwrap_or_else(|e| {
        if cli.verbose {
            eprintln!("Using default configuration ({:#})", e);
        }
        AppConfig::default()
    });

    // Initialize logging
    let logging = logging_config(&config, cli.verbose, cli.format);
    if let Err(e) = cl_observability::logging::init_logging_with_config(logging) {
        eprintln!("{}: {}", "Logging disabled".yellow(), e);
    }

    // Execute command
    match cli.command {
        Commands::Collect { target } => cmd_collect(target, config, cli.format, cli.verbose).await,
        Commands::Validate { config: cfg_path } => {
            cmd_validate(cfg_path.unwrap_or(config_path)).await
        }
        Commands::Config { show_secrets } => cmd_config(config, show_secrets, cli.format).await,
        Commands::Sources { action } => cmd_sources(action, config, cli.format).await,
        Commands::Mapping { action } => cmd_mapping(action, config, cli.format).await,
    }
}

/// Logging setup for a run. JSON reports own stdout, so logs go to stderr.
fn logging_config(config: &AppConfig, verbose: bool, format: OutputFormat) -> LoggingConfig {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::from_str(&config.logging.level).unwrap_or(tracing::Level::INFO)
    };
    LoggingConfig {
        level,
        json_format: config.logging.json_format,
        log_file: config.log_file_path.clone(),
        ..Default::default()
    }
    .with_console_stderr(format == OutputFormat::Json)
}

async fn cmd_collect(
    target: CollectCommands,
    config: AppConfig,
    format: OutputFormat,
    verbose: bool,
) -> Result<()> {
    let summary = match target {
        CollectCommands::Aws { environment } => {
            if format == OutputFormat::Text {
                println!(
                    "Collecting AWS evidence for {}",
                    environment.cyan().bold()
                );
            }
            collect_aws(&config, &environment).await?
        }
        CollectCommands::Source {
            name,
            collectors,
            days,
        } => {
            if format == OutputFormat::Text {
                println!("Collecting SaaS evidence");
            }
            collect_sources(&config, &name, &collectors, days).await?
        }
    };

    report(&summary, format, verbose)?;
    if summary.totals.operations_failed > 0 {
        std::process::exit(EXIT_PARTIAL);
    }
    Ok(())
}

fn report(summary: &RunSummary, format: OutputFormat, verbose: bool) -> Result<()> {
    if format == OutputFormat::Json {
        let output = json!({
            "ledger": summary.ledger,
            "totals": summary.totals,
            "manifest": summary.manifest.as_ref().map(|m| m.path.display().to_string()),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_summary(summary, verbose);
    }
    Ok(())
}

async fn cmd_validate(config_path: PathBuf) -> Result<()> {
    println!(
        "Validating configuration: {}",
        config_path.display().to_string().cyan()
    );

    let config = match AppConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("{}: {:#}", "Configuration file error".red().bold(), e);
            std::process::exit(1);
        }
    };

    let validation_result = ConfigValidator::validate(&config);
    validation_result.print();

    // Summary
    println!();
    println!("{}", "Configuration Summary".bold());
    println!("─────────────────────");
    println!("  Evidence directory: {}", config.base_dir.display());
    println!(
        "  Mapping: {}",
        config.framework_mapping_path.display()
    );
    println!(
        "  AWS environments: {}",
        config.aws.environment_names().join(", ")
    );
    println!(
        "  Enabled roles: {}",
        config
            .aws
            .evidence_collection_enabled
            .values()
            .filter(|e| **e)
            .count()
    );
    println!(
        "  Enabled services: {}",
        config.aws.services.values().filter(|e| **e).count()
    );
    println!(
        "  Enabled sources: {}",
        config
            .sources
            .enabled_platforms()
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    if validation_result.has_errors() {
        println!();
        println!(
            "{}",
            "Configuration validation failed. Fix the errors above."
                .red()
                .bold()
        );
        std::process::exit(1);
    } else if validation_result.has_warnings() {
        println!();
        println!(
            "{}",
            "Configuration is valid with warnings. Review the warnings above."
                .yellow()
                .bold()
        );
    } else {
        println!();
        println!("{}", "Configuration is valid.".green().bold());
    }

    Ok(())
}

async fn cmd_config(config: AppConfig, show_secrets: bool, format: OutputFormat) -> Result<()> {
    let display_config = if show_secrets {
        config
    } else {
        config.redact_secrets()
    };

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&display_config)?);
    } else {
        println!("{}", "Current Configuration".bold());
        println!("─────────────────────────");
        print!("{}", serde_yaml::to_string(&display_config)?);
    }

    Ok(())
}

async fn cmd_sources(action: SourceCommands, config: AppConfig, format: OutputFormat) -> Result<()> {
    match action {
        SourceCommands::List => {
            if format == OutputFormat::Json {
                let sources: Vec<_> = Platform::SAAS
                    .iter()
                    .filter_map(|p| {
                        config.sources.connector(*p).map(|c| {
                            json!({
                                "platform": p.to_string(),
                                "name": c.name,
                                "base_url": c.base_url,
                                "enabled": config.sources.is_enabled(*p),
                            })
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&sources)?);
                return Ok(());
            }

            println!("{}", "Configured Sources".bold());
            println!("──────────────────");
            for platform in Platform::SAAS {
                let Some(connector) = config.sources.connector(platform) else {
                    continue;
                };
                let status = if config.sources.is_enabled(platform) {
                    "enabled".green()
                } else {
                    "disabled".red()
                };
                println!(
                    "  {} ({}) - {}",
                    platform.to_string().cyan(),
                    connector.base_url,
                    status
                );
                if let Ok(Some(source)) = config.sources.build(platform) {
                    println!("      collectors: {}", source.collectors().join(", "));
                }
            }
        }
        SourceCommands::Test { name } => {
            let platform = Platform::from_str(&name)?;
            println!("Testing source: {}", platform.to_string().cyan());

            let Some(source) = config.sources.build(platform)? else {
                println!("{}", "Source not configured or disabled".red());
                std::process::exit(1);
            };

            let health = source.health_check().await?;
            match &health {
                ConnectorHealth::Healthy => println!("  Health: {}", "healthy".green()),
                ConnectorHealth::Degraded(reason) => {
                    println!("  Health: {} ({})", "degraded".yellow(), reason)
                }
                ConnectorHealth::Unhealthy(reason) => {
                    println!("  Health: {} ({})", "unhealthy".red(), reason)
                }
                ConnectorHealth::Unknown => println!("  Health: {}", "unknown".yellow()),
            }

            match source.test_connection().await {
                Ok(true) => println!("  Credentials: {}", "accepted".green()),
                Ok(false) => {
                    println!("  Credentials: {}", "rejected".red());
                    std::process::exit(1);
                }
                Err(e) => {
                    println!("  Credentials: {} ({})", "error".red(), e);
                    std::process::exit(1);
                }
            }
        }
    }
    Ok(())
}

async fn cmd_mapping(action: MappingCommands, config: AppConfig, format: OutputFormat) -> Result<()> {
    let mapping = FrameworkMapping::load(&config.framework_mapping_path)?;

    match action {
        MappingCommands::List { service } => {
            let entries: Vec<_> = mapping
                .entries()
                .iter()
                .filter(|e| service.as_deref().map_or(true, |s| e.service == s))
                .collect();

            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }

            println!("{}", "Mapped Operations".bold());
            println!("─────────────────");
            for entry in &entries {
                let enabled = if config.aws.services.get(&entry.service).copied().unwrap_or(false)
                {
                    "enabled".green()
                } else {
                    "disabled".red()
                };
                let mut refs = entry.frameworks.soc2.clone();
                refs.extend(entry.frameworks.iso27001.iter().cloned());
                println!(
                    "  {}.{} - {} [{}]",
                    entry.service.cyan(),
                    entry.function,
                    enabled,
                    refs.join(", ")
                );
            }
            println!();
            println!("  {} operations", entries.len());
        }
        MappingCommands::Check => {
            let result = ConfigValidator::validate_mapping(&config, &mapping);
            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&mapping.validate())?);
            } else {
                println!(
                    "Checking mapping: {}",
                    config.framework_mapping_path.display().to_string().cyan()
                );
                result.print();
                println!();
                for (service, count) in mapping.services() {
                    println!("  {}: {}", service, count);
                }
            }
            if result.has_errors() {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}
