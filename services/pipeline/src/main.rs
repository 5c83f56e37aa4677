use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;

use pipeline::config::{PipelineConfig, USER_AGENT};
use pipeline::consolidate::ConsolidateOutcome;
use pipeline::fetch::Quarter;
use pipeline::{aggregate, consolidate, enrich, extract, fetch, load, validate};

#[derive(Parser, Debug)]
#[command(
    name = "pipeline",
    about = "Quarterly disclosure ETL for the health-insurance open-data portal",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download the most recent quarterly disclosure archives
    Fetch {
        /// How many quarterly archives to end up with
        #[arg(long)]
        quarters: Option<usize>,
        /// How many quarters to probe before giving up
        #[arg(long)]
        max_attempts: Option<usize>,
    },
    /// Normalize every tabular entry of the downloaded archives into staging
    Extract,
    /// Merge staged tables into the consolidated expense table
    Consolidate,
    /// Join the consolidated table with the operator registry
    Enrich,
    /// Summarize enriched rows per entity and region
    Aggregate,
    /// Replace the relational store with the current outputs
    Load,
    /// Tag consolidated rows with data-quality codes
    Validate,
    /// Run fetch, extract, consolidate, enrich, aggregate, and load in order
    Run {
        /// How many quarterly archives to end up with
        #[arg(long)]
        quarters: Option<usize>,
        /// Use the archives already on disk, skipping downloads
        #[arg(long)]
        skip_fetch: bool,
        /// Stop before the relational load
        #[arg(long)]
        skip_load: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env()?;

    println!("=== Saúde Transparente Pipeline ===");
    println!("Fonte: dados abertos ANS (dadosabertos.ans.gov.br)");

    match cli.command {
        Commands::Fetch {
            quarters,
            max_attempts,
        } => run_fetch(&config, quarters, max_attempts).await?,
        Commands::Extract => run_extract(&config)?,
        Commands::Consolidate => {
            run_consolidate(&config)?;
        }
        Commands::Enrich => run_enrich(&config).await?,
        Commands::Aggregate => run_aggregate(&config)?,
        Commands::Load => run_load(&config).await?,
        Commands::Validate => run_validate(&config)?,
        Commands::Run {
            quarters,
            skip_fetch,
            skip_load,
        } => run_all(&config, quarters, skip_fetch, skip_load).await?,
    }

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pipeline=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn build_client(config: &PipelineConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .build()
        .context("Failed to build HTTP client")
}

// ============================================================================
// Stage runners
// ============================================================================

async fn run_fetch(
    config: &PipelineConfig,
    quarters: Option<usize>,
    max_attempts: Option<usize>,
) -> Result<()> {
    let mut config = config.clone();
    if let Some(n) = quarters {
        config.fetch_quarters = n;
    }
    if let Some(a) = max_attempts {
        config.fetch_max_attempts = a;
    }

    let start = Quarter::latest_closed(Local::now().date_naive());
    println!(
        "\n=== Fetch: up to {} archives, scanning back from {} ===",
        config.fetch_quarters,
        start.label()
    );

    let client = build_client(&config)?;
    let summary = fetch::fetch_archives(&client, &config, start).await?;
    println!(
        "Fetch done: {} archives on disk ({} downloaded, {} already present, {} quarters probed)",
        summary.obtained.len(),
        summary.downloaded,
        summary.already_present,
        summary.attempts
    );
    Ok(())
}

fn run_extract(config: &PipelineConfig) -> Result<()> {
    println!("\n=== Extract: normalizing archive entries ===");
    let summary = extract::extract_archives(config)?;
    println!(
        "Extract done: {} archives ({} unreadable), {} entries staged, {} skipped, {} rows",
        summary.archives,
        summary.archives_failed,
        summary.entries_staged,
        summary.entries_skipped,
        summary.rows_staged
    );
    Ok(())
}

/// Returns true when a consolidated table was written.
fn run_consolidate(config: &PipelineConfig) -> Result<bool> {
    println!("\n=== Consolidate: merging staged tables ===");
    match consolidate::consolidate_staging(config)? {
        ConsolidateOutcome::Written(summary) => {
            println!(
                "Consolidate done: {} rows from {} files ({} skipped, {} duplicates, {} zero amounts)",
                summary.rows,
                summary.files_read,
                summary.files_skipped,
                summary.duplicates_dropped,
                summary.zero_amount_dropped
            );
            println!("  -> {}", config.consolidated_path().display());
            Ok(true)
        }
        ConsolidateOutcome::NoData => {
            println!("⚠ No staged tables found, nothing to consolidate");
            Ok(false)
        }
    }
}

async fn run_enrich(config: &PipelineConfig) -> Result<()> {
    println!("\n=== Enrich: joining the operator registry ===");
    let client = build_client(config)?;
    let summary = enrich::enrich_consolidated(&client, config).await?;
    println!(
        "Enrich done: {} rows ({} matched, {} unmatched) against {} registry entities",
        summary.rows, summary.matched, summary.unmatched, summary.registry_entities
    );
    println!("  -> {}", config.enriched_path().display());
    Ok(())
}

fn run_aggregate(config: &PipelineConfig) -> Result<()> {
    println!("\n=== Aggregate: per-entity, per-region statistics ===");
    let summary = aggregate::aggregate_enriched(config)?;
    println!(
        "Aggregate done: {} groups from {} rows",
        summary.groups, summary.rows_read
    );
    println!("  -> {}", config.aggregates_path().display());
    println!("  -> {}", config.aggregates_bundle_path().display());
    Ok(())
}

async fn run_load(config: &PipelineConfig) -> Result<()> {
    println!("\n=== Load: replacing the relational store ===");
    let db_url = config
        .db_url
        .clone()
        .context("DB_URL must be set for the load stage")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    let summary = load::load_store(&pool, config).await?;
    println!(
        "Load done: {} entities, {} fact records ({} without a loaded entity), {} aggregates",
        summary.entities, summary.facts, summary.facts_dropped, summary.aggregates
    );
    Ok(())
}

fn run_validate(config: &PipelineConfig) -> Result<()> {
    println!("\n=== Validate: tagging consolidated rows ===");
    let summary = validate::validate_consolidated(config)?;
    println!(
        "Validate done: {} rows ({} valid, {} flagged)",
        summary.rows, summary.valid, summary.flagged
    );
    println!("  -> {}", config.validated_path().display());
    Ok(())
}

async fn run_all(
    config: &PipelineConfig,
    quarters: Option<usize>,
    skip_fetch: bool,
    skip_load: bool,
) -> Result<()> {
    if skip_fetch {
        println!("\nSkipping fetch, using archives already on disk");
    } else {
        run_fetch(config, quarters, None).await?;
    }

    run_extract(config)?;

    // Stop rather than let downstream stages silently reuse an output
    // from an earlier run.
    if !run_consolidate(config)? {
        bail!("staging produced no usable tables; aborting before enrichment");
    }

    run_enrich(config).await?;
    run_aggregate(config)?;

    if skip_load {
        println!("\nSkipping relational load");
    } else {
        run_load(config).await?;
    }

    println!("\n✓ Pipeline complete");
    Ok(())
}
