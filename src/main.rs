mod db;
mod dimensions;
mod error;
mod feed;
mod loader;
mod settings;
mod sources;
mod utils;
mod writer;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use dimensions::Family;
use feed::fallback::ParentsChain;
use feed::{FeedOutcome, FeedRunner};
use loader::{FileOutcome, LoadOptions};
use settings::Settings;
use sources::FeedSource;
use utils::{format_duration, truncate};

#[derive(Parser)]
#[command(name = "flats_ingest", about = "Real-estate XML feed ingestion into SQLite")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema and the data directory
    Init,
    /// Download and parse feeds into .jsonl artifacts
    Extract {
        /// Only this source id (default: every source in the catalogue)
        #[arg(short, long)]
        source: Option<String>,
    },
    /// Load .jsonl artifacts into the flats table
    Load {
        /// Only this file in the data directory (default: every non-empty .jsonl)
        #[arg(short, long)]
        file: Option<String>,
    },
    /// Extract + load in one go (only artifacts of successful feeds are loaded)
    Run {
        #[arg(short, long)]
        source: Option<String>,
    },
    /// Show store statistics
    Stats,
    /// List dimension entries
    Dimensions {
        #[arg(value_enum)]
        family: Family,
        /// Only entries without a normalized label
        #[arg(long)]
        pending: bool,
    },
    /// Set the normalized label of a dimension entry
    Curate {
        #[arg(value_enum)]
        family: Family,
        id: String,
        label: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Arc::new(Settings::load()?);

    let result = match cli.command {
        Commands::Init => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            std::fs::create_dir_all(&settings.data_dir)
                .with_context(|| format!("Failed to create {:?}", settings.data_dir))?;
            println!(
                "Schema ready at {:?}, artifacts go to {:?}",
                settings.db_path, settings.data_dir
            );
            Ok(())
        }
        Commands::Extract { source } => {
            let sources = select_sources(&settings, source.as_deref())?;
            println!("Extracting {} feeds...", sources.len());
            let outcomes = extract(&settings, sources).await?;
            print_feed_outcomes(&outcomes);
            Ok(())
        }
        Commands::Load { file } => {
            let files = match file {
                Some(name) => vec![settings.data_dir.join(name)],
                None => loader::artifacts_in(&settings.data_dir)?,
            };
            if files.is_empty() {
                println!("No artifacts to load. Run 'extract' first.");
                return Ok(());
            }
            println!("Loading {} files...", files.len());
            let outcomes = load(&settings, files).await?;
            print_file_outcomes(&outcomes);
            Ok(())
        }
        Commands::Run { source } => {
            let sources = select_sources(&settings, source.as_deref())?;

            // Phase 1: Extract
            let t_extract = Instant::now();
            println!("Pipeline: extracting {} feeds...", sources.len());
            let outcomes = extract(&settings, sources).await?;
            println!("Extracted in {:.1}s", t_extract.elapsed().as_secs_f64());
            print_feed_outcomes(&outcomes);

            let files: Vec<PathBuf> = outcomes
                .iter()
                .filter(|o| o.success && o.records > 0)
                .map(|o| o.artifact.clone())
                .collect();
            if files.is_empty() {
                println!("Nothing to load (no feed produced records).");
                return Ok(());
            }

            // Phase 2: Load
            let t_load = Instant::now();
            println!("Loading {} artifacts...", files.len());
            let loaded = load(&settings, files).await?;
            println!("Loaded in {:.1}s", t_load.elapsed().as_secs_f64());
            print_file_outcomes(&loaded);
            Ok(())
        }
        Commands::Stats => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Flats:        {}", s.flats);
            println!("Room types:   {} ({} pending)", s.room_types, s.room_types_pending);
            println!("Status types: {} ({} pending)", s.status_types, s.status_types_pending);
            if !s.sources.is_empty() {
                println!("\n--- Flats per source ---");
                for (source, count) in &s.sources {
                    println!("  {:<12} {:>8}", truncate(source, 12), count);
                }
            }
            Ok(())
        }
        Commands::Dimensions { family, pending } => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let entries = db::list_dimensions(&conn, family, pending)?;
            if entries.is_empty() {
                println!("No entries.");
                return Ok(());
            }
            println!("{:<32} | {:<8} | {:<28} | {:<20}", "Id", "Source", "Name", "Normalized");
            println!("{}", "-".repeat(96));
            for e in &entries {
                println!(
                    "{:<32} | {:<8} | {:<28} | {:<20}",
                    truncate(&e.id, 32),
                    truncate(&e.source_id, 8),
                    truncate(&e.name, 28),
                    truncate(&e.normalized, 20)
                );
            }
            println!("\n{} entries", entries.len());
            Ok(())
        }
        Commands::Curate { family, id, label } => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            if db::set_normalized(&conn, family, &id, &label)? == 0 {
                bail!("No {} entry with id {:?}", family.table(), id);
            }
            println!("{} -> {:?}", id, label);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn select_sources(settings: &Settings, only: Option<&str>) -> anyhow::Result<Vec<FeedSource>> {
    let mut sources = sources::load_sources(&settings.sources_path)?;
    if let Some(id) = only {
        sources.retain(|s| s.id == id);
        if sources.is_empty() {
            bail!("Source {:?} not found in {:?}", id, settings.sources_path);
        }
    }
    Ok(sources)
}

async fn extract(settings: &Arc<Settings>, sources: Vec<FeedSource>) -> anyhow::Result<Vec<FeedOutcome>> {
    let runner = Arc::new(FeedRunner::new(Arc::clone(settings), Arc::new(ParentsChain))?);
    Ok(runner.run_all(sources).await)
}

async fn load(settings: &Settings, files: Vec<PathBuf>) -> anyhow::Result<Vec<FileOutcome>> {
    let conn = db::connect(&settings.db_path)?;
    db::init_schema(&conn)?;
    let opts = LoadOptions {
        batch_size: settings.load_batch_size,
        workers: settings.load_workers,
        queue: settings.writer_queue,
    };
    let outcomes = loader::load_files(conn, files, opts).await?;
    loader::summarize(&outcomes);
    Ok(outcomes)
}

fn print_feed_outcomes(outcomes: &[FeedOutcome]) {
    let ok = outcomes.iter().filter(|o| o.success).count();
    let records: usize = outcomes.iter().map(|o| o.records).sum();
    for o in outcomes.iter().filter(|o| !o.success) {
        println!(
            "  FAILED {:<12} {}",
            truncate(&o.source_id, 12),
            o.error.as_deref().unwrap_or("unknown error")
        );
    }
    for o in outcomes.iter().filter(|o| o.used_fallback) {
        println!("  fallback {:<12} {} records", truncate(&o.source_id, 12), o.records);
    }
    println!(
        "Done: {} feeds ({} ok, {} failed), {} records.",
        outcomes.len(),
        ok,
        outcomes.len() - ok,
        records
    );
}

fn print_file_outcomes(outcomes: &[FileOutcome]) {
    let ok = outcomes.iter().filter(|o| o.succeeded()).count();
    let rows: usize = outcomes.iter().map(|o| o.loaded).sum();
    let skipped: usize = outcomes.iter().map(|o| o.skipped).sum();
    let batches: usize = outcomes.iter().map(|o| o.batches).sum();
    for o in outcomes.iter().filter(|o| !o.succeeded()) {
        println!(
            "  FAILED {:?} after {} rows: {}",
            o.path,
            o.loaded,
            o.error.as_deref().unwrap_or("unknown error")
        );
    }
    println!(
        "Done: {} files ({} ok, {} failed), {} rows upserted in {} batches, {} lines skipped.",
        outcomes.len(),
        ok,
        outcomes.len() - ok,
        rows,
        batches,
        skipped
    );
}
