//! Ingestion layer: from transcript files on disk to typed domain events
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  appeared/changed/removed  ┌────────────────┐
//! │ DirectoryMonitor │ ─────────────────────────► │    Pipeline    │
//! │ (notify + scan)  │                            │ (single owner) │
//! └──────────────────┘                            └────────────────┘
//!          │ spawns                                   ▲       │
//!          ▼                                          │       ▼
//! ┌──────────────────┐        Intake (bounded)        │ ┌────────────────┐
//! │ LogTailer task   │ ───────────────────────────────┘ │ RecordDecoder  │
//! │ (one per file)   │                                  │ → SessionStore │
//! └──────────────────┘                                  └────────────────┘
//! ```
//!
//! Tailers only read. Everything that changes state happens on the pipeline
//! task, in intake order, so per-file apply order equals line order.

pub mod decoder;
pub mod monitor;
pub mod tailer;

pub use decoder::{
    correlate, DecodeStats, DecodedRecord, DomainEvent, EventBody, LineOrigin, RecordDecoder,
    RecordItem,
};
pub use monitor::{DirectoryMonitor, FileEvent, MonitorSettings};
pub use tailer::{
    spawn_tailer, LogTailer, ResetReason, TailBatch, TailedLine, TailerHandle, TailerSettings,
};

use std::path::PathBuf;

/// Items flowing from tailer tasks to the pipeline
#[derive(Debug)]
pub enum Intake {
    /// Newly read lines of one file
    Batch(TailBatch),
    /// A file kept failing to read and is considered permanently unreadable
    Unreadable { path: PathBuf, error: String },
}

impl Intake {
    pub fn path(&self) -> &std::path::Path {
        match self {
            Intake::Batch(batch) => &batch.path,
            Intake::Unreadable { path, .. } => path,
        }
    }
}
