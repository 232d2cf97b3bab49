//! # skynet-core
//!
//! Core library for skynet - a supervisor for coding-agent sessions.
//!
//! This library provides:
//! - Incremental, crash-safe tailing of JSONL session transcripts
//! - Decoding of transcript records into typed domain events
//! - The session store (SQLite) with lifecycle status tracking
//! - Notification classification, dedup, rate limiting and delivery
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! ```text
//! DirectoryMonitor ─▶ LogTailer ─▶ RecordDecoder ─▶ SessionStore ─▶ NotificationEngine ─▶ Broadcaster
//!   (discovery,        (bytes →      (lines →          (events →       (deltas →              (per-channel
//!    fs events)         lines)        events)           deltas)         notifications)         delivery)
//! ```
//!
//! The [`Pipeline`] wires them together on a single task.
//!
//! ## Example
//!
//! ```rust,no_run
//! use skynet_core::{Config, Database, NotificationLedger, Pipeline, PipelineConfig};
//! use std::sync::Arc;
//!
//! let config = Config::load().expect("failed to load config");
//! let path = config.database_path();
//! let db = Database::open(&path).expect("failed to open database");
//! // The ledger uses its own connection to the same file
//! let ledger_db = Database::open(&path).expect("failed to open database");
//! let ledger = Arc::new(NotificationLedger::new(ledger_db).expect("failed to open ledger"));
//!
//! let mut pipeline = Pipeline::new(PipelineConfig::from(&config), db, ledger, Vec::new())
//!     .expect("failed to build pipeline");
//! let result = pipeline.sync_once().expect("sync failed");
//! println!("{} files", result.files);
//! ```

// Re-export commonly used items at the crate root
pub use commands::{Command, CommandQueue, LaunchRequest};
pub use config::Config;
pub use db::{Database, SessionFilter};
pub use error::{Error, Result};
pub use notify::{NotificationLedger, Subscriber, TelegramSubscriber, UiFeed};
pub use pipeline::{Pipeline, PipelineConfig, PipelineHandle, PipelineStats, SyncResult};
pub use store::{SessionStore, StoreSettings};
pub use types::*;

// Public modules
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod format;
pub mod ingest;
pub mod logging;
pub mod notify;
pub mod pipeline;
pub mod store;
pub mod types;
