use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use strata_index::{CompactReport, IndexDatabase, IndexPool, VerifyOptions};
use tracing::{debug, info};

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Inspect and repair a deduplicating backup index", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (defaults to ~/.strata/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Index database, overriding the config file
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the structural consistency of the index
    Verify {
        /// Also compare every fileset's file list with its stored entries
        #[arg(long)]
        filelists: bool,

        /// Skip the checks tying filesets to remote files volumes
        #[arg(long)]
        lax: bool,
    },

    /// Repair duplicate rows and missing blocklist hashes
    Repair,

    /// Report wasted space and whether compacting is due
    CompactReport,

    /// List filesets, newest first
    Filesets {
        /// Also list the files of each fileset
        #[arg(long)]
        files: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(database) = cli.database {
        config.database = database;
    }
    debug!("Using index database {}", config.database.display());

    let pool = open_index(&config)?;

    match cli.command {
        Commands::Verify { filelists, lax } => {
            let options = VerifyOptions::new(&config.index)
                .verify_filelists(filelists)
                .lax(lax);
            pool.verify(options)
                .await
                .context("Index verification failed")?;
            print(cli.json, &Status { ok: true }, || "Index is consistent".to_string())?;
        }
        Commands::Repair => {
            pool.repair(config.index.clone())
                .await
                .context("Index repair failed")?;
            pool.verify(VerifyOptions::new(&config.index))
                .await
                .context("Index is still inconsistent after repair")?;
            print(cli.json, &Status { ok: true }, || "Index repaired".to_string())?;
        }
        Commands::CompactReport => {
            let report = pool.compact_report(config.index.compact.clone()).await?;
            print(cli.json, &report, || describe_report(&report))?;
        }
        Commands::Filesets { files } => {
            let mut listing = Vec::new();
            for fileset in pool.filesets().await? {
                let entries = if files {
                    pool.fileset_entries(fileset.id).await?
                } else {
                    Vec::new()
                };
                listing.push(FilesetListing { fileset, entries });
            }
            print(cli.json, &listing, || describe_filesets(&listing))?;
        }
    }

    Ok(())
}

/// Check the stored options against the config, then pool the database
fn open_index(config: &Config) -> Result<IndexPool> {
    if !config.database.exists() {
        bail!("No index database at {}", config.database.display());
    }

    let db = IndexDatabase::open(&config.database)
        .with_context(|| format!("Failed to open index {}", config.database.display()))?;
    db.check_options(&config.index)
        .context("Index options do not match the config")?;
    drop(db);

    let pool = IndexPool::new(&config.database)
        .with_context(|| format!("Failed to open index {}", config.database.display()))?;
    info!("Opened index {}", config.database.display());
    Ok(pool)
}

#[derive(Serialize)]
struct Status {
    ok: bool,
}

#[derive(Serialize)]
struct FilesetListing {
    #[serde(flatten)]
    fileset: strata_index::Fileset,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    entries: Vec<strata_index::FilesetFileEntry>,
}

fn print<T: Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(value).context("Failed to serialize output")?
        );
    } else {
        println!("{}", text());
    }
    Ok(())
}

fn describe_report(report: &CompactReport) -> String {
    let mut lines = vec![format!(
        "{} bytes in block volumes, {} bytes wasted",
        report.full_size, report.wasted_space
    )];
    for volume in &report.deletable {
        lines.push(format!("  deletable: {} ({} bytes)", volume.name, volume.compressed_size));
    }
    for volume in report.compactable_volumes() {
        lines.push(format!(
            "  compactable: {} ({} of {} bytes wasted)",
            volume.name, volume.wasted_size, volume.data_size
        ));
    }
    lines.push(format!(
        "Reclaim: {}, compact: {} ({})",
        report.should_reclaim(),
        report.should_compact(),
        report.reason()
    ));
    lines.join("\n")
}

fn describe_filesets(listing: &[FilesetListing]) -> String {
    if listing.is_empty() {
        return "No filesets".to_string();
    }

    let mut lines = Vec::new();
    for (version, item) in listing.iter().enumerate() {
        lines.push(format!(
            "{}\t{}\t{}",
            version,
            item.fileset.timestamp.to_rfc3339(),
            if item.fileset.is_full_backup { "full" } else { "partial" }
        ));
        for entry in &item.entries {
            lines.push(format!("  {:?}\t{}", entry.kind, entry.path));
        }
    }
    lines.join("\n")
}
