//! skynet - session supervisor
//!
//! Tails coding-agent transcripts, keeps the session store current and relays
//! noteworthy events to the terminal and, when configured, to Telegram.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/skynet/state.db (~/.local/share/skynet/state.db)
//! - Logs: $XDG_STATE_HOME/skynet/skynet.log (~/.local/state/skynet/skynet.log)
//! - Config: $XDG_CONFIG_HOME/skynet/config.toml (~/.config/skynet/config.toml)

mod launcher;
mod process_lock;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use skynet_core::format::short_id;
use skynet_core::{
    Config, Database, Notification, NotificationLedger, Pipeline, PipelineConfig, PipelineStats,
    Subscriber, TelegramSubscriber, UiFeed,
};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::process_lock::acquire_ingest_guard;

/// Capacity of the in-process notification feed
const UI_FEED_CAPACITY: usize = 256;

/// Pending continue-session requests
const LAUNCH_QUEUE: usize = 16;

#[derive(Parser)]
#[command(name = "skynet")]
#[command(about = "Watch agent session transcripts and relay what needs attention")]
#[command(version)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/skynet/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Sessions root, overriding watch.sessions_root
    #[arg(long)]
    root: Option<PathBuf>,

    /// Mirror logs to stderr
    #[arg(long)]
    foreground_log: bool,

    /// Print notifications as JSON lines
    #[arg(long)]
    json: bool,

    /// Ignore continue-session commands instead of running the agent
    #[arg(long)]
    no_launcher: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;
    if let Some(root) = &args.root {
        config.watch.sessions_root = root.clone();
    }

    let _log_guard = skynet_core::logging::init(&config.logging, args.foreground_log)
        .context("failed to initialize logging")?;

    tracing::info!("skynet starting");

    let db_path = config.database_path();
    let _ingest_guard = acquire_ingest_guard(&db_path).context("failed to acquire process lock")?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let stats = runtime.block_on(supervise(config, db_path, &args))?;

    println!(
        "Stopped: {} lines read, {} messages, {} sessions created, {} notifications ({} delivered, {} failed)",
        stats.lines_read,
        stats.messages_applied,
        stats.sessions_created,
        stats.notifications_emitted,
        stats.deliveries_succeeded,
        stats.deliveries_failed
    );
    tracing::info!(?stats, "skynet stopped");
    Ok(())
}

async fn supervise(config: Config, db_path: PathBuf, args: &Args) -> Result<PipelineStats> {
    tracing::info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).context("failed to open database")?;
    // The ledger gets its own connection so delivery workers never wait on ingest
    let ledger_db = Database::open(&db_path).context("failed to open ledger database")?;
    let ledger = Arc::new(NotificationLedger::new(ledger_db).context("failed to open ledger")?);

    let feed = Arc::new(UiFeed::new(UI_FEED_CAPACITY));
    let readings = feed.subscribe();
    let mut subscribers: Vec<Arc<dyn Subscriber>> = vec![feed.clone() as Arc<dyn Subscriber>];
    if config.telegram.is_ready() {
        let telegram =
            TelegramSubscriber::new(&config.telegram).context("failed to create Telegram channel")?;
        subscribers.push(Arc::new(telegram));
        println!("Telegram: enabled");
    }

    let mut pipeline = Pipeline::new(PipelineConfig::from(&config), db, ledger, subscribers)
        .context("failed to create pipeline")?;
    let handle = pipeline.handle();
    let shutdown = handle.shutdown_token();

    let launcher_task = if args.no_launcher {
        None
    } else {
        let (outlet, requests) = mpsc::channel(LAUNCH_QUEUE);
        pipeline = pipeline.with_launcher(outlet);
        Some(tokio::spawn(launcher::run(
            config.commands.clone(),
            requests,
            shutdown.clone(),
        )))
    };
    let printer_task = tokio::spawn(print_notifications(readings, args.json, shutdown.clone()));

    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::info!("Received shutdown signal");
            shutdown.cancel();
        })
        .context("failed to set Ctrl+C handler")?;
    }

    println!("Database: {}", db_path.display());
    println!("Watching: {}", config.watch.root().display());
    println!("Press Ctrl+C to stop\n");

    let result = pipeline.run().await;

    // Startup failures return without the token having fired
    handle.shutdown();
    if let Some(task) = launcher_task {
        let _ = task.await;
    }
    let _ = printer_task.await;

    result.context("pipeline failed")
}

/// Write UI notifications to stdout until shutdown, then flush what is buffered
async fn print_notifications(
    mut readings: broadcast::Receiver<Notification>,
    json: bool,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = readings.recv() => match received {
                Ok(notification) => print_notification(&notification, json),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Notification printer fell behind");
                }
                Err(RecvError::Closed) => return,
            },
        }
    }

    // Deliveries made while the pipeline drained
    loop {
        match readings.try_recv() {
            Ok(notification) => print_notification(&notification, json),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
}

fn print_notification(notification: &Notification, json: bool) {
    if json {
        match serde_json::to_string(notification) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "Cannot serialize notification"),
        }
        return;
    }

    let session = notification
        .session_id
        .as_deref()
        .map(short_id)
        .unwrap_or("-");
    println!(
        "[{}] {:<6} {:<18} {:<8} {}",
        notification.timestamp.with_timezone(&chrono::Local).format("%H:%M:%S"),
        notification.priority.as_str(),
        notification.kind.as_str(),
        session,
        notification.summary
    );
}
