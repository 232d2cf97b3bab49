//! skynet-sync - one-shot ingest of session transcripts into the store
//!
//! Reads every transcript under the sessions root up to its end, applies the
//! new lines and settles session statuses, then exits. Nothing is delivered:
//! the first `skynet` run treats what this tool ingested as history.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/skynet/state.db (~/.local/share/skynet/state.db)
//! - Logs: $XDG_STATE_HOME/skynet/skynet.log (~/.local/state/skynet/skynet.log)
//! - Config: $XDG_CONFIG_HOME/skynet/config.toml (~/.config/skynet/config.toml)

mod process_lock;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use indicatif::{ProgressBar, ProgressStyle};
use skynet_core::{Config, Database, NotificationLedger, Pipeline, PipelineConfig, SyncResult};

use crate::process_lock::acquire_ingest_guard;

#[derive(Parser)]
#[command(name = "skynet-sync")]
#[command(about = "Ingest agent session transcripts into the store once")]
#[command(version)]
struct Args {
    /// Verbose output (-v per-file errors, -vv all counters)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Dry run - discover files but don't sync
    #[arg(long)]
    dry_run: bool,

    /// Config file (default: $XDG_CONFIG_HOME/skynet/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Sessions root, overriding watch.sessions_root
    #[arg(long)]
    root: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;
    if let Some(root) = &args.root {
        config.watch.sessions_root = root.clone();
    }

    let _log_guard = skynet_core::logging::init(&config.logging, false)
        .context("failed to initialize logging")?;

    tracing::info!("skynet-sync starting");

    // Resolve database path and enforce process-level exclusivity for it.
    let db_path = config.database_path();
    let _ingest_guard = acquire_ingest_guard(&db_path).context("failed to acquire process lock")?;

    tracing::info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).context("failed to open database")?;
    let ledger_db = Database::open(&db_path).context("failed to open ledger database")?;
    let ledger = Arc::new(NotificationLedger::new(ledger_db).context("failed to open ledger")?);

    println!("Database: {}", db_path.display());

    // No subscribers: sync never delivers
    let mut pipeline = Pipeline::new(PipelineConfig::from(&config), db, ledger, Vec::new())
        .context("failed to create pipeline")?;

    let root = config.watch.root();
    if args.dry_run {
        let files = pipeline.discover().context("discovery failed")?;
        println!("Found {} transcript(s) under {}", files.len(), root.display());
        if args.verbose >= 1 {
            for path in &files {
                println!("  {}", shorten_path(path, &root));
            }
        }
        println!("\nDry run - no sync performed");
        tracing::info!("Dry run complete");
        return Ok(());
    }

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("invalid progress template")?
            .progress_chars("#>-"),
    );

    let result = pipeline
        .sync_once_with_progress(|current, total, path| {
            if current == 0 {
                pb.set_length(total as u64);
            }
            pb.set_position(current as u64);
            pb.set_message(
                path.file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("...")
                    .to_string(),
            );
        })
        .context("sync failed")?;

    pb.finish_and_clear();

    print_sync_result(&result, &root, args.verbose);

    tracing::info!(
        files = result.files,
        errors = result.errors.len(),
        messages_applied = result.stats.messages_applied,
        "skynet-sync complete"
    );

    Ok(())
}

/// Print sync result summary
fn print_sync_result(result: &SyncResult, root: &Path, verbose: u8) {
    let stats = &result.stats;
    println!("\nSync complete:");
    println!("  Files scanned:     {}", result.files);
    println!("  Lines read:        {}", stats.lines_read);
    println!("  Messages applied:  {}", stats.messages_applied);
    println!("  Duplicates:        {}", stats.duplicates_skipped);
    println!("  Sessions created:  {}", stats.sessions_created);
    println!("  Status changes:    {}", stats.transitions);
    println!("  Decode errors:     {}", stats.decode_errors);
    println!("  Files with errors: {}", result.errors.len());

    if verbose >= 1 {
        for (path, error) in &result.errors {
            println!("  Error: {}: {}", shorten_path(path, root), error);
        }
    }

    if verbose >= 2 {
        println!("  Ignored records:   {}", stats.ignored_records);
        println!("  Out of order:      {}", stats.out_of_order_dropped);
        println!("  Files reset:       {}", stats.files_reset);
        println!("  Read errors:       {}", stats.read_errors);
    }
}

/// Path relative to the sessions root, for display
fn shorten_path(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}
