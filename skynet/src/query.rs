//! skynet-query - read-only inspection of the session store
//!
//! Opens the database read-only, so it is safe to run next to `skynet` or
//! `skynet-sync`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use skynet_core::format::{format_relative_time, project_name, short_id, truncate};
use skynet_core::{Config, Database, Message, MessageKind, SessionFilter, SessionStatus};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "skynet-query")]
#[command(about = "Inspect sessions, messages and notifications in the skynet store")]
#[command(version)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/skynet/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit JSON instead of a table
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: QueryCommand,
}

#[derive(Subcommand)]
enum QueryCommand {
    /// List sessions, most recently updated first
    Sessions {
        /// Only sessions in this status (discovered, active, idle, completed, failed)
        #[arg(long)]
        status: Option<SessionStatus>,

        /// Only sessions updated at or after this RFC 3339 time
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Show the messages of one session in transcript order
    Messages {
        /// Session ID (unique prefix accepted)
        session_id: String,

        #[arg(long, default_value = "200")]
        limit: usize,
    },
    /// Show recent notification deliveries
    Notifications {
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;

    let _log_guard = skynet_core::logging::init(&config.logging, false)
        .context("failed to initialize logging")?;

    let db_path = config.database_path();
    let db = Database::open_read_only(&db_path).context("failed to open database")?;

    match args.command {
        QueryCommand::Sessions {
            status,
            since,
            limit,
        } => list_sessions(&db, status, since, limit, args.json),
        QueryCommand::Messages { session_id, limit } => {
            show_messages(&db, &session_id, limit, args.json)
        }
        QueryCommand::Notifications { limit } => list_notifications(&db, limit, args.json),
    }
}

fn list_sessions(
    db: &Database,
    status: Option<SessionStatus>,
    since: Option<DateTime<Utc>>,
    limit: usize,
    as_json: bool,
) -> Result<()> {
    let filter = SessionFilter {
        status,
        since,
        limit: Some(limit),
        ..Default::default()
    };
    let sessions = db.list_sessions(&filter)?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    let now = Utc::now();
    println!(
        "{:<10} {:<10} {:<20} {:<10} {:>8}",
        "SESSION", "STATUS", "PROJECT", "ACTIVE", "MESSAGES"
    );
    for session in &sessions {
        let count = db.count_session_messages(&session.id)?;
        println!(
            "{:<10} {:<10} {:<20} {:<10} {:>8}",
            short_id(&session.id),
            session.status.as_str(),
            truncate(session.cwd.as_deref().map(project_name).unwrap_or("-"), 20),
            format_relative_time(session.last_activity_at, now),
            count
        );
    }
    println!("\n{} session(s)", sessions.len());
    Ok(())
}

fn show_messages(db: &Database, session_id: &str, limit: usize, as_json: bool) -> Result<()> {
    let session_id = resolve_session_id(db, session_id)?;
    let messages = db.get_session_messages(&session_id, limit)?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&messages)?);
        return Ok(());
    }

    println!("Session {} ({} message(s))\n", session_id, messages.len());
    for message in &messages {
        println!(
            "[{}] {:<15} {}",
            message.timestamp.format("%Y-%m-%d %H:%M:%S"),
            message.kind.as_str(),
            describe(message)
        );
    }
    Ok(())
}

/// Exact id first, then a unique prefix
fn resolve_session_id(db: &Database, query: &str) -> Result<String> {
    if let Some(session) = db.get_session(query)? {
        return Ok(session.id);
    }

    let matches: Vec<String> = db
        .list_sessions(&SessionFilter::default())?
        .into_iter()
        .filter(|s| s.id.starts_with(query))
        .map(|s| s.id)
        .collect();

    match matches.as_slice() {
        [] => anyhow::bail!("No session found matching '{}'", query),
        [only] => Ok(only.clone()),
        _ => anyhow::bail!(
            "'{}' matches {} sessions; use a longer prefix",
            query,
            matches.len()
        ),
    }
}

/// One-line description of a message
fn describe(message: &Message) -> String {
    match message.kind {
        MessageKind::ToolInvocation => {
            let input = message
                .tool_input
                .as_ref()
                .map(|v| truncate(&v.to_string(), 60))
                .unwrap_or_default();
            format!(
                "{} {}",
                message.tool_name.as_deref().unwrap_or("tool"),
                input
            )
        }
        MessageKind::ToolResult if message.is_error => {
            format!("ERROR {}", truncate(message.text.as_deref().unwrap_or(""), 80))
        }
        _ => truncate(message.text.as_deref().unwrap_or(""), 100),
    }
}

fn list_notifications(db: &Database, limit: usize, as_json: bool) -> Result<()> {
    let records = db.recent_notification_records(limit)?;

    if as_json {
        let rows: Vec<_> = records
            .iter()
            .map(|r| {
                json!({
                    "event_key": r.event_key,
                    "channel": r.channel,
                    "state": r.state,
                    "kind": r.kind,
                    "attempts": r.attempts,
                    "emitted_at": r.emitted_at,
                    "last_error": r.last_error,
                    "summary": r.notification.summary,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No notifications recorded.");
        return Ok(());
    }

    let now = Utc::now();
    for record in &records {
        println!(
            "{:<10} {:<9} {:<10} {:<18} {}",
            format_relative_time(record.emitted_at, now),
            record.channel,
            record.state.as_str(),
            record.kind.as_str(),
            truncate(&record.notification.summary, 70)
        );
        if let Some(error) = &record.last_error {
            println!("{:>10} last error: {}", "", truncate(error, 80));
        }
    }
    Ok(())
}
