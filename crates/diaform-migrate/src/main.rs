//! Diaform Migration CLI
//!
//! CLI tool for migrating a Diaform knowledge base from MongoDB to PostgreSQL.
//! Pedantic lints relaxed for CLI ergonomics.

// CLI tool - relax pedantic lints for ergonomics
#![allow(clippy::pedantic)]

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use diaform_migrate::backfill::backfill_first_created;
use diaform_migrate::config::CONFIG_TEMPLATE;
use diaform_migrate::reprocess::reprocess_content;
use diaform_migrate::{create_target, content, MigrationConfig, MigrationReport, Pipeline};

/// Exit status after Ctrl-C, as shells report SIGINT.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "diaform-migrate")]
#[command(version)]
#[command(about = "Migrate a Diaform knowledge base from MongoDB to PostgreSQL", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the migration
    Run {
        /// Configuration file path; without it, configuration comes from DIAFORM_* variables
        #[arg(short, long, value_name = "FILE", env = "DIAFORM_MIGRATE_CONFIG")]
        config: Option<PathBuf>,

        /// Dry run mode (write to an in-memory target)
        #[arg(long)]
        dry_run: bool,

        /// Batch size override
        #[arg(long)]
        batch_size: Option<usize>,

        /// Write the final report as JSON
        #[arg(long, value_name = "FILE")]
        report: Option<PathBuf>,

        /// Hide progress bars
        #[arg(long)]
        no_progress: bool,
    },

    /// Validate configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },

    /// Generate example configuration
    Init {
        /// Output file path
        #[arg(short, long, default_value = "migration.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the JSON token array for a piece of content
    Tokenize {
        /// Raw content
        text: String,
    },

    /// Recompute json_content for every thing in the destination
    Reprocess {
        /// Configuration file path
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Fill first_created from thing names where it is missing
    Backfill {
        /// Configuration file path
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            config,
            dry_run,
            batch_size,
            report,
            no_progress,
        } => {
            let mut config = load_config(config.as_deref())?;
            if dry_run {
                config.options.dry_run = true;
            }
            if let Some(bs) = batch_size {
                config.options.batch_size = bs;
            }
            if no_progress {
                config.options.progress = false;
            }
            run_migration(&config, report.as_deref()).await?;
        }
        Commands::Validate { config } => {
            validate_config(&config)?;
        }
        Commands::Init { output, force } => {
            generate_config(&output, force)?;
        }
        Commands::Tokenize { text } => {
            println!("{}", serde_json::to_string_pretty(&content::to_json(&text))?);
        }
        Commands::Reprocess { config } => {
            let config = load_config(config.as_deref())?;
            let mut target = create_target(&config.destination, config.options.dry_run).await?;
            let stats = reprocess_content(target.as_mut(), config.options.batch_size).await?;
            target.close().await?;
            println!(
                "Reprocessed {} things: {} updated, {} unchanged",
                stats.total, stats.migrated, stats.unchanged
            );
        }
        Commands::Backfill { config } => {
            let config = load_config(config.as_deref())?;
            let mut target = create_target(&config.destination, config.options.dry_run).await?;
            let outcome = backfill_first_created(target.as_mut(), config.options.batch_size).await?;
            target.close().await?;
            println!(
                "Scanned {} things: {} first_created set, {} already set, {} skipped",
                outcome.stats.total,
                outcome.stats.migrated,
                outcome.stats.unchanged,
                outcome.stats.skipped
            );
            for warning in &outcome.warnings {
                println!("  {}", warning);
            }
        }
    }

    Ok(())
}

/// Loads the YAML file with environment overrides, or the environment alone.
fn load_config(path: Option<&Path>) -> anyhow::Result<MigrationConfig> {
    let config = match path {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            let mut config = MigrationConfig::from_file(path)?;
            config.apply_env_overrides()?;
            config
        }
        None => {
            info!("No configuration file, reading DIAFORM_* environment variables");
            MigrationConfig::from_env()?
        }
    };
    config.validate()?;
    Ok(config)
}

async fn run_migration(config: &MigrationConfig, report_path: Option<&Path>) -> anyhow::Result<()> {
    let mut pipeline = Pipeline::from_config(config).await?;

    let outcome = tokio::select! {
        result = pipeline.run() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    let Some(result) = outcome else {
        let report = pipeline.abort().await;
        finish_report(&report, report_path)?;
        eprintln!("Interrupted before commit; nothing was written. Re-run to resume.");
        std::process::exit(EXIT_INTERRUPTED);
    };

    finish_report(pipeline.report(), report_path)?;
    result?;
    Ok(())
}

fn finish_report(report: &MigrationReport, path: Option<&Path>) -> anyhow::Result<()> {
    println!("\n{}", report);
    if let Some(path) = path {
        std::fs::write(path, report.to_json()?)?;
        info!("Report written to {:?}", path);
    }
    Ok(())
}

fn validate_config(config_path: &Path) -> anyhow::Result<()> {
    info!("Validating configuration from {:?}", config_path);

    let mut config = MigrationConfig::from_file(config_path)?;
    config.apply_env_overrides()?;
    config.validate()?;

    println!("Configuration is valid");
    println!("   Source:      {}", config.source.kind());
    println!("   Destination: {}", config.destination.kind());
    println!("   Batch size:  {}", config.options.batch_size);
    if config.options.legacy_children {
        println!("   Legacy children lists will be converted");
    }

    Ok(())
}

fn generate_config(output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        warn!("{:?} already exists", output);
        anyhow::bail!("refusing to overwrite {:?} (use --force)", output);
    }

    std::fs::write(output, CONFIG_TEMPLATE)?;
    println!("Generated configuration: {:?}", output);
    println!(
        "   Edit the file and run: diaform-migrate run --config {:?}",
        output
    );

    Ok(())
}
