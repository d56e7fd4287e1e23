use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use visapath_storage::{GraphStore, MemoryGraphStore, Neo4jStore};
use visapath_sync::{RunSummary, SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "visapath")]
#[command(about = "Load the UK sponsor register into a graph and match job ads against it")]
struct Cli {
    /// Use an in-memory graph instead of Neo4j; nothing is persisted.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Print run summaries as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge a sponsor-register CSV into the graph.
    LoadRegister {
        csv: PathBuf,
        /// Provenance timestamp for this load (RFC 3339, defaults to now).
        #[arg(long)]
        load_ts: Option<DateTime<Utc>>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Match job-search JSON files against the register and write them.
    EnrichJobs {
        #[arg(required = true)]
        json_files: Vec<PathBuf>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        threshold: Option<f64>,
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Show the match decision for one company name.
    Match { company: String },
    /// Verify connectivity and uniqueness constraints.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("visapath=info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut config = if cli.dry_run {
        SyncConfig::from_env_offline()
    } else {
        SyncConfig::from_env()
    }
    .context("reading configuration")?;
    apply_overrides(&mut config, &cli.command)?;

    let store: Arc<dyn GraphStore> = if cli.dry_run {
        info!("dry run: using an in-memory graph");
        Arc::new(MemoryGraphStore::new())
    } else {
        let store = Neo4jStore::connect(&config.graph)
            .await
            .with_context(|| format!("connecting to {}", config.graph.uri))?;
        Arc::new(store)
    };

    let pipeline = SyncPipeline::new(config, store);
    let cancel = pipeline.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight batches");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    match cli.command {
        Commands::LoadRegister { csv, load_ts, .. } => {
            let load_ts = load_ts.unwrap_or_else(Utc::now);
            let summary = pipeline.load_registry_file(&csv, load_ts).await?;
            report("load-register", &summary, cli.json)?;
        }
        Commands::EnrichJobs { json_files, .. } => {
            let summary = pipeline.enrich_job_files(&json_files).await?;
            report("enrich-jobs", &summary, cli.json)?;
        }
        Commands::Match { company } => match pipeline.match_company(&company).await? {
            Some(decision) => println!(
                "match: organisation={} score={:.3}",
                decision.organisation_key, decision.score
            ),
            None => println!("no match above {:.2}", pipeline.config().matching.threshold),
        },
        Commands::Check => {
            pipeline.prepare_store().await?;
            println!("check ok: backend={}", pipeline.store().backend());
        }
    }

    Ok(())
}

fn apply_overrides(config: &mut SyncConfig, command: &Commands) -> Result<()> {
    match command {
        Commands::LoadRegister {
            batch_size,
            workers,
            ..
        } => {
            if let Some(size) = positive("--batch-size", *batch_size)? {
                config.batches.registry_batch_size = size;
            }
            if let Some(workers) = positive("--workers", *workers)? {
                config.batches.workers = workers;
            }
        }
        Commands::EnrichJobs {
            batch_size,
            threshold,
            workers,
            ..
        } => {
            if let Some(size) = positive("--batch-size", *batch_size)? {
                config.batches.job_batch_size = size;
            }
            if let Some(workers) = positive("--workers", *workers)? {
                config.batches.workers = workers;
            }
            if let Some(threshold) = threshold {
                if !(0.0..=1.0).contains(threshold) {
                    bail!("--threshold must be between 0 and 1, got {threshold}");
                }
                config.matching.threshold = *threshold;
            }
        }
        Commands::Match { .. } | Commands::Check => {}
    }
    Ok(())
}

fn positive(flag: &str, value: Option<usize>) -> Result<Option<usize>> {
    match value {
        Some(0) => bail!("{flag} must be at least 1"),
        other => Ok(other),
    }
}

fn report(command: &str, summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(summary).context("serializing run summary")?
        );
    } else {
        println!(
            "{command} complete: run_id={} seen={} skipped={} written={} matched={} batches={} failed={}{}",
            summary.run_id,
            summary.records_seen,
            summary.records_skipped,
            summary.records_written,
            summary.records_matched,
            summary.batches_total,
            summary.batches_failed,
            if summary.cancelled { " (cancelled)" } else { "" }
        );
        if let Some(reason) = &summary.aborted {
            println!("  aborted: {reason}");
        }
        for failure in &summary.failures {
            println!(
                "  batch {} [{}..{}): {}",
                failure.batch_index, failure.range_start, failure.range_end, failure.error
            );
        }
    }

    if summary.batches_failed > 0 {
        bail!("{} of {} batches failed", summary.batches_failed, summary.batches_total);
    }
    Ok(())
}
