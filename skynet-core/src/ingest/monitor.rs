//! Directory monitor for transcript roots
//!
//! Discovers `*.jsonl` transcripts at any depth below the root, watches the
//! tree for changes, and owns one [`LogTailer`] task per live file.
//!
//! Startup order matters: [`DirectoryMonitor::watch`] is started before
//! [`DirectoryMonitor::discover`] runs, so a file created during the
//! enumeration pass is reported by at least one of them. Both paths go through
//! the same `known` set, so it is reported only once.
//!
//! Bursts of filesystem events are coalesced by `notify-debouncer-mini`; a
//! burst of writes to one file becomes a single wake of its tailer.

use super::tailer::{spawn_tailer, LogTailer, TailerHandle, TailerSettings};
use super::Intake;
use crate::error::{Error, Result};
use crate::types::Cursor;
use glob::Pattern;
use notify_debouncer_mini::notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Transcript file extension
const TRANSCRIPT_EXT: &str = "jsonl";

/// Lifecycle event for one transcript
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Appeared(PathBuf),
    Changed(PathBuf),
    Removed(PathBuf),
}

impl FileEvent {
    pub fn path(&self) -> &Path {
        match self {
            FileEvent::Appeared(p) | FileEvent::Changed(p) | FileEvent::Removed(p) => p,
        }
    }
}

/// Monitor settings
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub root: PathBuf,
    /// Glob patterns (relative to the root) of derived transcripts to skip
    pub ignore: Vec<String>,
    pub debounce: Duration,
    pub tailer: TailerSettings,
}

/// Watches a transcript root and drives tailers
pub struct DirectoryMonitor {
    root: PathBuf,
    ignore: Vec<Pattern>,
    debounce: Duration,
    tailer_settings: TailerSettings,
    intake: mpsc::Sender<Intake>,
    cancel: CancellationToken,
    known: HashSet<PathBuf>,
    tailers: HashMap<PathBuf, TailerHandle>,
    debouncer: Option<Debouncer<RecommendedWatcher>>,
    raw_events: Option<mpsc::UnboundedReceiver<Vec<PathBuf>>>,
}

impl DirectoryMonitor {
    /// Create a monitor for `settings.root`.
    ///
    /// Fails with [`Error::Config`] when the root is missing, not a directory,
    /// or unreadable, or when an ignore pattern is not a valid glob.
    pub fn new(
        settings: MonitorSettings,
        intake: mpsc::Sender<Intake>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let root = settings.root;
        let metadata = std::fs::metadata(&root).map_err(|e| {
            Error::Config(format!("sessions root {} is not accessible: {}", root.display(), e))
        })?;
        if !metadata.is_dir() {
            return Err(Error::Config(format!(
                "sessions root {} is not a directory",
                root.display()
            )));
        }
        std::fs::read_dir(&root).map_err(|e| {
            Error::Config(format!("sessions root {} is not readable: {}", root.display(), e))
        })?;

        let ignore = settings
            .ignore
            .iter()
            .map(|p| {
                Pattern::new(p)
                    .map_err(|e| Error::Config(format!("invalid ignore pattern {:?}: {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            root,
            ignore,
            debounce: settings.debounce,
            tailer_settings: settings.tailer,
            intake,
            cancel,
            known: HashSet::new(),
            tailers: HashMap::new(),
            debouncer: None,
            raw_events: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `path` is a transcript this monitor ingests
    pub fn is_transcript(&self, path: &Path) -> bool {
        path.extension().and_then(|e| e.to_str()) == Some(TRANSCRIPT_EXT) && !self.is_ignored(path)
    }

    fn is_ignored(&self, path: &Path) -> bool {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        self.ignore.iter().any(|p| p.matches_path(relative))
    }

    /// Full enumeration pass. Returns transcripts not seen before, sorted.
    pub fn discover(&mut self) -> Vec<PathBuf> {
        let root = self.root.clone();
        let found = self.scan(&root);
        let new: Vec<PathBuf> = found
            .into_iter()
            .filter(|p| self.known.insert(p.clone()))
            .collect();
        tracing::info!(
            root = %self.root.display(),
            files = new.len(),
            "Discovery pass complete"
        );
        new
    }

    /// Walk `dir` recursively. Unreadable subdirectories are logged and skipped.
    fn scan(&self, dir: &Path) -> BTreeSet<PathBuf> {
        let mut found = BTreeSet::new();
        let mut stack = vec![dir.to_path_buf()];

        while let Some(current) = stack.pop() {
            let entries = match std::fs::read_dir(&current) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(dir = %current.display(), error = %e, "Cannot read directory");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };
                if file_type.is_dir() {
                    stack.push(path);
                } else if self.is_transcript(&path) {
                    found.insert(path);
                }
            }
        }
        found
    }

    /// Start the recursive filesystem watcher
    pub fn watch(&mut self) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut debouncer = new_debouncer(self.debounce, move |res: DebounceEventResult| match res {
            Ok(events) => {
                let paths: Vec<PathBuf> = events.into_iter().map(|e| e.path).collect();
                if !paths.is_empty() {
                    let _ = tx.send(paths);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Filesystem watch error"),
        })?;
        debouncer
            .watcher()
            .watch(&self.root, RecursiveMode::Recursive)?;

        tracing::info!(root = %self.root.display(), debounce = ?self.debounce, "Watching sessions root");
        self.debouncer = Some(debouncer);
        self.raw_events = Some(rx);
        Ok(())
    }

    /// Stop watching; pending raw events are discarded
    pub fn unwatch(&mut self) {
        if self.debouncer.take().is_some() {
            tracing::debug!(root = %self.root.display(), "Watcher stopped");
        }
        self.raw_events = None;
    }

    /// Wait for the next debounced burst and classify it.
    ///
    /// Returns `None` once the watcher has stopped. A burst may classify to
    /// an empty list (changes to ignored files, for instance).
    pub async fn next_events(&mut self) -> Option<Vec<FileEvent>> {
        let paths = self.raw_events.as_mut()?.recv().await?;
        Some(self.classify(paths))
    }

    /// Turn raw changed paths into lifecycle events
    pub fn classify(&mut self, paths: Vec<PathBuf>) -> Vec<FileEvent> {
        let unique: BTreeSet<PathBuf> = paths.into_iter().collect();
        let mut events = Vec::new();

        for path in unique {
            if path.is_dir() {
                // A new or moved-in directory may carry transcripts of its own
                for found in self.scan(&path) {
                    if self.known.insert(found.clone()) {
                        events.push(FileEvent::Appeared(found));
                    }
                }
                continue;
            }

            if path.exists() {
                if !self.is_transcript(&path) {
                    continue;
                }
                if self.known.insert(path.clone()) {
                    events.push(FileEvent::Appeared(path));
                } else {
                    events.push(FileEvent::Changed(path));
                }
                continue;
            }

            // Gone: a single file, or a whole directory of them
            if self.known.remove(&path) {
                events.push(FileEvent::Removed(path));
            } else {
                let gone: Vec<PathBuf> = self
                    .known
                    .iter()
                    .filter(|k| k.starts_with(&path))
                    .cloned()
                    .collect();
                for k in gone {
                    self.known.remove(&k);
                    events.push(FileEvent::Removed(k));
                }
            }
        }

        events
    }

    // ============================================
    // Tailer management
    // ============================================

    /// Start tailing `path` from `cursor`
    pub fn track(&mut self, path: &Path, cursor: Option<Cursor>, backfill: bool) {
        if self.tailers.contains_key(path) {
            self.wake(path);
            return;
        }
        self.known.insert(path.to_path_buf());
        let tailer = LogTailer::open(path, cursor);
        let handle = spawn_tailer(
            tailer,
            self.intake.clone(),
            self.tailer_settings.clone(),
            backfill,
            &self.cancel,
        );
        tracing::debug!(path = %path.display(), backfill, "Tailer started");
        self.tailers.insert(path.to_path_buf(), handle);
    }

    /// Nudge the tailer of `path` to read now
    pub fn wake(&self, path: &Path) {
        if let Some(handle) = self.tailers.get(path) {
            handle.wake();
        }
    }

    /// Send the tailer of `path` back to a persisted cursor, reading again after `delay`
    pub fn rewind(&self, path: &Path, cursor: Cursor, delay: Duration) {
        if let Some(handle) = self.tailers.get(path) {
            handle.rewind(cursor, delay);
        }
    }

    /// Stop reading `path` for good. The file stays tracked until it is removed.
    pub fn abandon(&self, path: &Path) {
        if let Some(handle) = self.tailers.get(path) {
            handle.stop();
            tracing::debug!(path = %path.display(), "Tailer abandoned");
        }
    }

    /// Stop tailing `path` and wait for its task to finish
    pub async fn untrack(&mut self, path: &Path) {
        self.known.remove(path);
        if let Some(handle) = self.tailers.remove(path) {
            handle.join().await;
            tracing::debug!(path = %path.display(), "Tailer stopped");
        }
    }

    /// Number of running tailers
    pub fn tracked(&self) -> usize {
        self.tailers.len()
    }

    /// Stop every tailer and wait for all of them
    pub async fn shutdown(&mut self) {
        self.unwatch();
        for handle in self.tailers.values() {
            handle.stop();
        }
        for (_, handle) in self.tailers.drain() {
            handle.join().await;
        }
    }
}
