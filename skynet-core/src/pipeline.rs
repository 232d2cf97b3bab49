//! The ingestion pipeline: one task that owns every piece of mutable state
//!
//! Data flow of [`Pipeline::run`]:
//!
//! 1. Check the sessions root and re-queue undelivered notifications.
//! 2. Start the watcher, then discover existing transcripts and spawn a tailer
//!    for each. Watching first means nothing written during discovery is
//!    missed.
//! 3. Loop: intake batches are decoded and applied line by line; each line's
//!    deltas go through the notification engine and the approved dispatches
//!    to the broadcaster. Timers drive the status sweep and rollup releases.
//! 4. On shutdown: stop the watcher and tailers, apply whatever is still
//!    queued, then give the broadcaster a grace period to drain.
//!
//! Everything that changes state runs on this task, in intake order.

use crate::commands::{Command, CommandQueue, LaunchRequest};
use crate::config::{Config, NotificationConfig};
use crate::db::Database;
use crate::error::Result;
use crate::ingest::{
    DirectoryMonitor, FileEvent, Intake, LineOrigin, LogTailer, MonitorSettings, RecordDecoder,
    TailBatch, TailedLine, TailerSettings,
};
use crate::notify::{
    Broadcaster, DeliveryOutcome, DeliveryReport, Dispatch, NotificationEngine,
    NotificationLedger, PublishStatus, RetryPolicy, Subscriber,
};
use crate::store::{SessionStore, StoreSettings};
use crate::types::{Delta, NotificationKind};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Depth of the command queue
const COMMAND_CAPACITY: usize = 64;

/// How long delivery workers get to drain at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything a pipeline needs to know, derived from [`Config`]
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub monitor: MonitorSettings,
    pub store: StoreSettings,
    pub notifications: NotificationConfig,
    pub intake_capacity: usize,
    pub sweep_interval: Duration,
    pub shutdown_grace: Duration,
}

impl From<&Config> for PipelineConfig {
    fn from(config: &Config) -> Self {
        Self {
            monitor: MonitorSettings {
                root: config.watch.root(),
                ignore: config.watch.ignore.clone(),
                debounce: config.watch.debounce(),
                tailer: TailerSettings {
                    poll_interval: config.watch.poll_interval(),
                    max_read_failures: config.watch.max_read_failures,
                },
            },
            store: StoreSettings {
                idle_threshold: config.lifecycle.idle_threshold(),
                completion_threshold: config.lifecycle.completion_threshold(),
            },
            notifications: config.notifications.clone(),
            intake_capacity: config.watch.intake_capacity,
            sweep_interval: config.lifecycle.sweep_interval(),
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }
}

/// Counters for one pipeline instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub files_discovered: u64,
    pub lines_read: u64,
    pub decode_errors: u64,
    pub ignored_records: u64,
    pub messages_applied: u64,
    pub duplicates_skipped: u64,
    pub out_of_order_dropped: u64,
    pub sessions_created: u64,
    pub transitions: u64,
    /// Files reported permanently unreadable
    pub read_errors: u64,
    /// Lines whose store transaction failed (re-read after a rewind)
    pub apply_errors: u64,
    pub files_reset: u64,
    pub notifications_emitted: u64,
    pub notifications_suppressed: u64,
    pub notifications_held: u64,
    pub rollups: u64,
    pub deliveries_succeeded: u64,
    pub deliveries_failed: u64,
}

/// Result of [`Pipeline::sync_once`]
#[derive(Debug, Default)]
pub struct SyncResult {
    /// Transcripts found under the root
    pub files: usize,
    /// Files that could not be read or applied (path, error)
    pub errors: Vec<(PathBuf, String)>,
    pub stats: PipelineStats,
}

/// Cloneable control surface of a running pipeline
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    commands: CommandQueue,
    shutdown: CancellationToken,
}

impl PipelineHandle {
    pub fn commands(&self) -> &CommandQueue {
        &self.commands
    }

    /// Ask the pipeline to stop; `run` returns once it has drained
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// A self-contained ingestion and notification instance
pub struct Pipeline {
    config: PipelineConfig,
    store: SessionStore,
    decoder: RecordDecoder,
    engine: NotificationEngine,
    ledger: Arc<NotificationLedger>,
    subscribers: Vec<Arc<dyn Subscriber>>,
    commands: CommandQueue,
    command_rx: mpsc::Receiver<Command>,
    launcher: Option<mpsc::Sender<LaunchRequest>>,
    shutdown: CancellationToken,
    /// Files whose tailer was rewound, with the offset of the line that failed
    rewinding: HashMap<PathBuf, u64>,
    /// Consecutive failed applies per file
    apply_failures: HashMap<PathBuf, u32>,
    /// Files given up on after repeated failed applies
    abandoned: HashSet<PathBuf>,
    counters: PipelineStats,
}

impl Pipeline {
    /// Build a pipeline over `db`. Subscriber names become the channels.
    pub fn new(
        config: PipelineConfig,
        db: Database,
        ledger: Arc<NotificationLedger>,
        subscribers: Vec<Arc<dyn Subscriber>>,
    ) -> Result<Self> {
        let store = SessionStore::open(db, config.store, Utc::now())?;
        let channels: Vec<String> = subscribers.iter().map(|s| s.name().to_string()).collect();
        let engine = NotificationEngine::new(&config.notifications, &channels);
        let (commands, command_rx) = CommandQueue::bounded(COMMAND_CAPACITY);

        Ok(Self {
            config,
            store,
            decoder: RecordDecoder::new(),
            engine,
            ledger,
            subscribers,
            commands,
            command_rx,
            launcher: None,
            shutdown: CancellationToken::new(),
            rewinding: HashMap::new(),
            apply_failures: HashMap::new(),
            abandoned: HashSet::new(),
            counters: PipelineStats::default(),
        })
    }

    /// Forward continue-session requests to `outlet`
    pub fn with_launcher(mut self, outlet: mpsc::Sender<LaunchRequest>) -> Self {
        self.launcher = Some(outlet);
        self
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            commands: self.commands.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn stats(&self) -> PipelineStats {
        let decode = self.decoder.stats();
        let store = self.store.stats();
        let engine = self.engine.stats();
        PipelineStats {
            decode_errors: decode.decode_errors,
            ignored_records: decode.ignored,
            messages_applied: store.messages_applied,
            duplicates_skipped: store.duplicates_skipped,
            out_of_order_dropped: store.out_of_order_dropped,
            sessions_created: store.sessions_created,
            transitions: store.transitions,
            notifications_emitted: engine.emitted,
            notifications_suppressed: engine.suppressed,
            notifications_held: engine.held,
            rollups: engine.rollups,
            ..self.counters
        }
    }

    // ============================================
    // One-shot sync
    // ============================================

    /// Discover every transcript and read each to its end once, without delivery.
    pub fn sync_once(&mut self) -> Result<SyncResult> {
        self.sync_once_with_progress(|_, _, _| {})
    }

    /// [`Pipeline::sync_once`] with a callback receiving
    /// `(current_file_index, total_files, file_path)` before each file.
    pub fn sync_once_with_progress<F>(&mut self, mut on_progress: F) -> Result<SyncResult>
    where
        F: FnMut(usize, usize, &Path),
    {
        let files = self.discover()?;
        let total = files.len();
        let mut result = SyncResult {
            files: total,
            ..Default::default()
        };

        for (i, path) in files.iter().enumerate() {
            on_progress(i, total, path);
            self.counters.files_discovered += 1;
            if let Err(e) = self.sync_file(path) {
                tracing::warn!(path = %path.display(), error = %e, "Sync failed for file");
                result.errors.push((path.clone(), e.to_string()));
            }
        }

        // Settle statuses of everything that went quiet meanwhile
        self.store.sweep(Utc::now())?;
        result.stats = self.stats();
        Ok(result)
    }

    /// Transcripts currently under the sessions root, sorted. Reads nothing.
    pub fn discover(&self) -> Result<Vec<PathBuf>> {
        // No tailers are spawned, so the intake end is never used
        let (intake, _unused) = mpsc::channel(1);
        let mut monitor = DirectoryMonitor::new(
            self.config.monitor.clone(),
            intake,
            self.shutdown.child_token(),
        )?;
        Ok(monitor.discover())
    }

    fn sync_file(&mut self, path: &Path) -> Result<()> {
        let cursor = self.store.cursor(path);
        let backfill = cursor.is_none();
        let mut tailer = LogTailer::open(path, cursor);
        loop {
            let mut batch = tailer.read_available()?;
            batch.backfill = backfill;
            let more = batch.more;
            self.apply_batch(batch, None).map_err(|failed| failed.error)?;
            if !more {
                return Ok(());
            }
        }
    }

    // ============================================
    // Long-running mode
    // ============================================

    /// Run until the shutdown token fires. Returns the final counters.
    ///
    /// Fails only at startup: an inaccessible root, a watcher that cannot
    /// start, or a ledger that cannot be read.
    pub async fn run(mut self) -> Result<PipelineStats> {
        let (intake_tx, mut intake) = mpsc::channel(self.config.intake_capacity.max(1));
        let mut monitor = DirectoryMonitor::new(
            self.config.monitor.clone(),
            intake_tx,
            self.shutdown.child_token(),
        )?;

        // Independent of `shutdown`, so workers get their grace period
        let delivery = CancellationToken::new();
        let mut broadcaster = Broadcaster::new(
            self.subscribers.clone(),
            Arc::clone(&self.ledger),
            RetryPolicy::from(&self.config.notifications),
            self.config.notifications.queue_capacity,
            &delivery,
        );
        let mut reports = broadcaster.take_reports();
        let recovered = broadcaster.recover().await?;
        if recovered > 0 {
            tracing::info!(recovered, "Re-queued undelivered notifications");
        }

        monitor.watch()?;
        for path in monitor.discover() {
            let cursor = self.store.cursor(&path);
            let backfill = cursor.is_none();
            monitor.track(&path, cursor, backfill);
            self.counters.files_discovered += 1;
        }
        tracing::info!(
            root = %monitor.root().display(),
            files = monitor.tracked(),
            channels = ?broadcaster.channels(),
            "Pipeline started"
        );

        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rollup = tokio::time::interval(self.config.notifications.rollup_check_interval());
        rollup.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watching = true;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(command) = self.command_rx.recv() => self.handle_command(command),
                Some(item) = intake.recv() => {
                    self.handle_intake(item, Some(&monitor), Some(&broadcaster));
                }
                events = monitor.next_events(), if watching => match events {
                    Some(events) => {
                        self.handle_file_events(events, &mut monitor, &mut intake, &broadcaster)
                            .await;
                    }
                    None => {
                        tracing::warn!("Filesystem watcher stopped, relying on polling");
                        watching = false;
                    }
                },
                Some(report) = next_report(&mut reports) => self.handle_report(report),
                _ = sweep.tick() => self.sweep(Utc::now(), Some(&broadcaster)),
                _ = rollup.tick() => self.release_held(Utc::now(), &broadcaster),
            }
        }

        tracing::info!("Shutting down pipeline");
        monitor.shutdown().await;
        // Closes the last intake senders
        drop(monitor);
        while let Some(item) = intake.recv().await {
            self.handle_intake(item, None, Some(&broadcaster));
        }

        broadcaster.shutdown(self.config.shutdown_grace).await;
        if let Some(reports) = reports.as_mut() {
            while let Ok(report) = reports.try_recv() {
                self.handle_report(report);
            }
        }
        self.persist_held(Utc::now());

        let stats = self.stats();
        tracing::info!(?stats, "Pipeline stopped");
        Ok(stats)
    }

    // ============================================
    // Intake
    // ============================================

    fn handle_intake(
        &mut self,
        item: Intake,
        monitor: Option<&DirectoryMonitor>,
        broadcaster: Option<&Broadcaster>,
    ) {
        match item {
            Intake::Batch(batch) => {
                let path = batch.path.clone();
                if self.abandoned.contains(&path) {
                    return;
                }
                if let Some(failed_at) = self.rewinding.get(&path).copied() {
                    // Batches read before the rewind took effect start past the failed line
                    let replay = batch.reset.is_some()
                        || batch.lines.first().is_some_and(|l| l.offset <= failed_at);
                    if !replay {
                        tracing::debug!(path = %path.display(), "Skipping batch read before rewind");
                        return;
                    }
                    self.rewinding.remove(&path);
                }

                match self.apply_batch(batch, broadcaster) {
                    Ok(()) => {
                        self.apply_failures.remove(&path);
                    }
                    Err(failed) => self.apply_failed(path, failed, monitor, broadcaster),
                }
            }
            Intake::Unreadable { path, error } => {
                self.counters.read_errors += 1;
                let now = Utc::now();
                match self.store.file_unreadable(&path, &error, now) {
                    Ok(Some(delta)) => self.notify(&delta, now, broadcaster),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(path = %path.display(), error = %e, "Cannot record unreadable file")
                    }
                }
            }
        }
    }

    /// Rewind after a failed apply, backing off, until the file is given up on
    fn apply_failed(
        &mut self,
        path: PathBuf,
        failed: FailedLine,
        monitor: Option<&DirectoryMonitor>,
        broadcaster: Option<&Broadcaster>,
    ) {
        self.counters.apply_errors += 1;
        let failures = {
            let count = self.apply_failures.entry(path.clone()).or_default();
            *count += 1;
            *count
        };
        let limit = self.config.monitor.tailer.max_read_failures.max(1);
        let Some(monitor) = monitor else {
            tracing::error!(path = %path.display(), offset = failed.offset, error = %failed.error, "Failed to apply line");
            return;
        };

        if failures < limit {
            let delay = self.apply_backoff(failures);
            tracing::error!(
                path = %path.display(),
                offset = failed.offset,
                error = %failed.error,
                failures,
                ?delay,
                "Failed to apply line, rewinding tailer"
            );
            let cursor = self.store.cursor(&path).unwrap_or_default();
            self.rewinding.insert(path.clone(), failed.offset);
            monitor.rewind(&path, cursor, delay);
            return;
        }

        tracing::error!(
            path = %path.display(),
            offset = failed.offset,
            error = %failed.error,
            failures,
            "Giving up on transcript after repeated apply failures"
        );
        monitor.abandon(&path);
        self.rewinding.remove(&path);
        self.apply_failures.remove(&path);
        self.abandoned.insert(path.clone());
        self.counters.read_errors += 1;

        let now = Utc::now();
        let error = format!("cannot apply line at offset {}: {}", failed.offset, failed.error);
        match self.store.file_unreadable(&path, &error, now) {
            Ok(Some(delta)) => self.notify(&delta, now, broadcaster),
            Ok(None) => {}
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Cannot record failed file")
            }
        }
    }

    /// Wait before re-reading after the `failures`-th failed apply
    fn apply_backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(6));
        self.config.monitor.tailer.poll_interval.saturating_mul(factor)
    }

    /// Apply every line of a batch in order, then persist the batch cursor.
    ///
    /// Stops at the first line whose transaction fails; that line and every
    /// later one must be read again.
    fn apply_batch(
        &mut self,
        batch: TailBatch,
        broadcaster: Option<&Broadcaster>,
    ) -> std::result::Result<(), FailedLine> {
        let path = batch.path.as_path();
        let now = Utc::now();

        if let Some(reason) = batch.reset {
            self.counters.files_reset += 1;
            tracing::info!(
                path = %path.display(),
                reason = reason.as_str(),
                generation = batch.cursor.generation,
                "Transcript restarted from the beginning"
            );
            self.store.reset_file(path);
        }

        for line in &batch.lines {
            self.counters.lines_read += 1;
            let deltas = self
                .apply_line(line, batch.backfill, now)
                .map_err(|error| FailedLine {
                    offset: line.offset,
                    error,
                })?;
            for delta in &deltas {
                self.notify(delta, now, broadcaster);
            }
        }

        // Covers blank and undecodable lines after the last applied one
        self.store
            .save_cursor(path, &batch.cursor, now)
            .map_err(|error| FailedLine {
                offset: batch.cursor.offset,
                error,
            })
    }

    fn apply_line(
        &mut self,
        line: &TailedLine,
        backfill: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<Delta>> {
        let Some(record) = self.decoder.decode(&line.text) else {
            return Ok(Vec::new());
        };
        let session_id = self
            .store
            .resolve_session(&line.path, record.session_id.as_deref());
        let origin = LineOrigin {
            path: &line.path,
            session_id: &session_id,
            generation: line.cursor.generation,
            offset: line.offset,
            line: &line.text,
            fallback_ts: now,
        };
        let events = record.into_events(&origin);
        self.store.apply_line(line, &events, backfill, now)
    }

    async fn handle_file_events(
        &mut self,
        events: Vec<FileEvent>,
        monitor: &mut DirectoryMonitor,
        intake: &mut mpsc::Receiver<Intake>,
        broadcaster: &Broadcaster,
    ) {
        for event in events {
            match event {
                FileEvent::Appeared(path) => {
                    self.counters.files_discovered += 1;
                    let cursor = self.store.cursor(&path);
                    monitor.track(&path, cursor, false);
                }
                FileEvent::Changed(path) => monitor.wake(&path),
                FileEvent::Removed(path) => {
                    monitor.untrack(&path).await;
                    // Apply whatever the stopped tailer already queued
                    while let Ok(item) = intake.try_recv() {
                        self.handle_intake(item, Some(&*monitor), Some(broadcaster));
                    }
                    self.rewinding.remove(&path);
                    self.apply_failures.remove(&path);
                    self.abandoned.remove(&path);
                    let now = Utc::now();
                    match self.store.file_removed(&path, now) {
                        Ok(Some(delta)) => self.notify(&delta, now, Some(broadcaster)),
                        Ok(None) => {}
                        Err(e) => {
                            tracing::error!(path = %path.display(), error = %e, "Cannot record removed file")
                        }
                    }
                }
            }
        }
    }

    // ============================================
    // Notifications
    // ============================================

    fn notify(&mut self, delta: &Delta, now: DateTime<Utc>, broadcaster: Option<&Broadcaster>) {
        let Some(broadcaster) = broadcaster else {
            return;
        };
        let dispatches = self.engine.process_at(delta, now);
        self.dispatch(dispatches, broadcaster);
    }

    fn dispatch(&mut self, dispatches: Vec<Dispatch>, broadcaster: &Broadcaster) {
        for Dispatch {
            channel,
            notification,
        } in dispatches
        {
            let outcome = broadcaster.dispatch(&channel, &notification);
            match outcome.status {
                PublishStatus::Enqueued
                | PublishStatus::AlreadyDelivered
                | PublishStatus::AlreadyFailed => {}
                PublishStatus::Backpressured => self.engine.defer(&channel, notification),
                PublishStatus::Closed | PublishStatus::Rejected(_) => {
                    tracing::warn!(channel = %channel, event_key = %notification.event_key, status = ?outcome.status, "Notification not queued");
                }
            }
        }
    }

    fn handle_report(&mut self, report: DeliveryReport) {
        match report.outcome {
            DeliveryOutcome::Delivered { .. } => self.counters.deliveries_succeeded += 1,
            DeliveryOutcome::Failed { .. } => {
                self.counters.deliveries_failed += 1;
                // One more chance inside the next rollup; a failed rollup is dropped
                if report.notification.kind != NotificationKind::Rollup {
                    self.engine.defer(&report.channel, report.notification);
                }
            }
        }
    }

    fn sweep(&mut self, now: DateTime<Utc>, broadcaster: Option<&Broadcaster>) {
        match self.store.sweep(now) {
            Ok(deltas) => {
                for delta in &deltas {
                    self.notify(delta, now, broadcaster);
                }
            }
            Err(e) => tracing::error!(error = %e, "Status sweep failed"),
        }
    }

    fn release_held(&mut self, now: DateTime<Utc>, broadcaster: &Broadcaster) {
        let dispatches = self.engine.tick(now);
        self.dispatch(dispatches, broadcaster);
    }

    /// Record whatever the engine still holds as pending, for the next start to deliver
    fn persist_held(&mut self, now: DateTime<Utc>) {
        for Dispatch {
            channel,
            notification,
        } in self.engine.flush(now)
        {
            match self.ledger.record_pending(&notification, &channel, now) {
                Ok(_) => tracing::info!(
                    channel = %channel,
                    event_key = %notification.event_key,
                    count = notification.rollup_count.unwrap_or(1),
                    "Held notifications saved for the next start"
                ),
                Err(e) => tracing::error!(
                    channel = %channel,
                    event_key = %notification.event_key,
                    error = %e,
                    "Cannot save held notifications"
                ),
            }
        }
    }

    // ============================================
    // Commands
    // ============================================

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::ContinueSession { session_id, text } => {
                let Some(session) = self.store.session(&session_id) else {
                    tracing::warn!(session_id = %session_id, "Continue request for unknown session");
                    return;
                };
                let request = LaunchRequest {
                    session_id,
                    text,
                    cwd: session.cwd.clone(),
                };
                match &self.launcher {
                    Some(outlet) => {
                        if let Err(e) = outlet.try_send(request) {
                            tracing::warn!(error = %e, "Launcher is not accepting requests");
                        }
                    }
                    None => {
                        tracing::warn!(session_id = %request.session_id, "No launcher configured")
                    }
                }
            }
            Command::MuteChannel { channel } => {
                if !self.engine.set_muted(&channel, true) {
                    tracing::warn!(channel = %channel, "Cannot mute unknown channel");
                }
            }
            Command::UnmuteChannel { channel } => {
                if !self.engine.set_muted(&channel, false) {
                    tracing::warn!(channel = %channel, "Cannot unmute unknown channel");
                }
            }
        }
    }
}

/// A line whose store transaction failed
struct FailedLine {
    offset: u64,
    error: crate::error::Error,
}

async fn next_report(
    reports: &mut Option<mpsc::UnboundedReceiver<DeliveryReport>>,
) -> Option<DeliveryReport> {
    match reports {
        Some(reports) => reports.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::UiFeed;
    use crate::types::{Notification, Priority};
    use std::io::Write;
    use tempfile::TempDir;

    const HELLO: &str = r#"{"type":"user","uuid":"u1","sessionId":"sess-1","cwd":"/home/me/skynet","timestamp":"2025-01-01T10:00:00Z","message":{"role":"user","content":"Hello"}}"#;
    const HI: &str = r#"{"type":"assistant","uuid":"a1","sessionId":"sess-1","timestamp":"2025-01-01T10:00:01Z","message":{"role":"assistant","content":[{"type":"text","text":"Hi there!"}]}}"#;
    const LS: &str = r#"{"type":"assistant","uuid":"a2","sessionId":"sess-1","timestamp":"2025-01-01T10:00:02Z","message":{"role":"assistant","content":[{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}]}}"#;

    fn question(uuid: &str, session: &str) -> String {
        format!(
            r#"{{"type":"assistant","uuid":"{}","sessionId":"{}","message":{{"role":"assistant","content":[{{"type":"text","text":"Shall I deploy?"}}]}}}}"#,
            uuid, session
        )
    }

    fn append(path: &Path, lines: &[&str]) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
    }

    fn config(root: &Path) -> PipelineConfig {
        let mut config = PipelineConfig::from(&Config::default());
        config.monitor.root = root.to_path_buf();
        config.monitor.debounce = Duration::from_millis(20);
        config.monitor.tailer.poll_interval = Duration::from_millis(50);
        config.sweep_interval = Duration::from_secs(60);
        config.shutdown_grace = Duration::from_millis(200);
        config
    }

    fn pipeline(root: &Path, subscribers: Vec<Arc<dyn Subscriber>>) -> Pipeline {
        let ledger = Arc::new(NotificationLedger::open_in_memory().unwrap());
        Pipeline::new(
            config(root),
            Database::open_in_memory().unwrap(),
            ledger,
            subscribers,
        )
        .unwrap()
    }

    async fn next_notification(
        feed: &mut tokio::sync::broadcast::Receiver<Notification>,
    ) -> Notification {
        tokio::time::timeout(Duration::from_secs(10), feed.recv())
            .await
            .expect("no notification in time")
            .unwrap()
    }

    #[test]
    fn test_sync_once_ingests_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("-home-me-skynet");
        std::fs::create_dir(&project).unwrap();
        append(&project.join("sess-1.jsonl"), &[HELLO, HI, LS]);

        let mut pipeline = pipeline(dir.path(), Vec::new());
        let result = pipeline.sync_once().unwrap();
        assert_eq!(result.files, 1);
        assert!(result.errors.is_empty());
        assert_eq!(result.stats.messages_applied, 3);
        assert_eq!(result.stats.lines_read, 3);

        let messages = pipeline
            .store()
            .db()
            .get_session_messages("sess-1", 10)
            .unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].text.as_deref(), Some("Hi there!"));
        assert_eq!(messages[2].tool_name.as_deref(), Some("Bash"));

        // Nothing new: the cursor was persisted
        let again = pipeline.sync_once().unwrap();
        assert_eq!(again.stats.lines_read, 3);
        assert_eq!(again.stats.messages_applied, 3);
    }

    #[tokio::test]
    async fn test_run_notifies_live_lines_but_not_history() {
        crate::logging::init_test();
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("old.jsonl");
        append(&old, &[&question("q-old", "old")]);

        let feed = Arc::new(UiFeed::new(16));
        let mut reader = feed.subscribe();
        let pipeline = pipeline(dir.path(), vec![feed.clone() as Arc<dyn Subscriber>]);
        let handle = pipeline.handle();
        let task = tokio::spawn(pipeline.run());

        // Give discovery a moment, then write live content
        tokio::time::sleep(Duration::from_millis(300)).await;
        let live = dir.path().join("live.jsonl");
        append(&live, &[&question("q-live", "live")]);

        let notification = next_notification(&mut reader).await;
        assert_eq!(notification.event_key, "q-live");
        assert_eq!(notification.priority, Priority::Low);
        assert!(notification.summary.starts_with("[QUESTION] live"));

        handle.shutdown();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.files_discovered, 2);
        assert_eq!(stats.messages_applied, 2);
        assert_eq!(stats.notifications_emitted, 1);
        assert!(stats.deliveries_succeeded >= 1);
    }

    #[tokio::test]
    async fn test_commands_mute_and_continue() {
        crate::logging::init_test();
        let dir = TempDir::new().unwrap();
        append(&dir.path().join("sess-1.jsonl"), &[HELLO]);

        let feed = Arc::new(UiFeed::new(16));
        let mut reader = feed.subscribe();
        let (outlet, mut launches) = mpsc::channel(4);
        let pipeline =
            pipeline(dir.path(), vec![feed.clone() as Arc<dyn Subscriber>]).with_launcher(outlet);
        let handle = pipeline.handle();
        let task = tokio::spawn(pipeline.run());
        tokio::time::sleep(Duration::from_millis(300)).await;

        handle
            .commands()
            .send(Command::ContinueSession {
                session_id: "sess-1".to_string(),
                text: "keep going".to_string(),
            })
            .await
            .unwrap();
        let request = tokio::time::timeout(Duration::from_secs(5), launches.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.cwd.as_deref(), Some("/home/me/skynet"));
        assert_eq!(request.text, "keep going");

        handle
            .commands()
            .send(Command::MuteChannel {
                channel: "ui".to_string(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        append(&dir.path().join("sess-1.jsonl"), &[&question("q-muted", "sess-1")]);
        tokio::time::sleep(Duration::from_millis(500)).await;

        handle
            .commands()
            .send(Command::UnmuteChannel {
                channel: "ui".to_string(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        append(&dir.path().join("sess-1.jsonl"), &[&question("q-loud", "sess-1")]);

        // The muted question never arrives
        let notification = next_notification(&mut reader).await;
        assert_eq!(notification.event_key, "q-loud");

        handle.shutdown();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.messages_applied, 3);
        assert_eq!(stats.sessions_created, 1);
    }

    #[tokio::test]
    async fn test_unreadable_file_fails_its_session() {
        crate::logging::init_test();
        let dir = TempDir::new().unwrap();
        let feed = Arc::new(UiFeed::new(16));
        let mut reader = feed.subscribe();
        let subscribers: Vec<Arc<dyn Subscriber>> = vec![feed.clone() as Arc<dyn Subscriber>];
        let mut pipeline = pipeline(dir.path(), subscribers.clone());
        let token = CancellationToken::new();
        let broadcaster = Broadcaster::new(
            subscribers,
            Arc::new(NotificationLedger::open_in_memory().unwrap()),
            RetryPolicy::from(&NotificationConfig::default()),
            8,
            &token,
        );

        pipeline.handle_intake(
            Intake::Unreadable {
                path: dir.path().join("sess-9.jsonl"),
                error: "permission denied".to_string(),
            },
            None,
            Some(&broadcaster),
        );

        let notification = next_notification(&mut reader).await;
        assert_eq!(notification.kind, NotificationKind::SessionFailed);
        assert_eq!(notification.priority, Priority::High);
        assert!(notification.summary.contains("permission denied"));
        assert_eq!(pipeline.stats().read_errors, 1);

        broadcaster.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_held_notifications_survive_restart() {
        crate::logging::init_test();
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("projects");
        std::fs::create_dir(&root).unwrap();
        let db_path = dir.path().join("state.db");

        let mut config = config(&root);
        config.notifications.channels.insert(
            "ui".to_string(),
            crate::config::ChannelConfig {
                rate_per_hour: 1,
                muted: false,
            },
        );
        let start = |feed: Arc<UiFeed>| {
            let ledger =
                Arc::new(NotificationLedger::new(Database::open(&db_path).unwrap()).unwrap());
            let pipeline = Pipeline::new(
                config.clone(),
                Database::open(&db_path).unwrap(),
                Arc::clone(&ledger),
                vec![feed as Arc<dyn Subscriber>],
            )
            .unwrap();
            (pipeline, ledger)
        };

        // First run: one token, three questions
        let feed = Arc::new(UiFeed::new(16));
        let mut reader = feed.subscribe();
        let (pipeline, ledger) = start(feed.clone());
        let handle = pipeline.handle();
        let task = tokio::spawn(pipeline.run());
        tokio::time::sleep(Duration::from_millis(300)).await;

        append(&root.join("a.jsonl"), &[&question("q-a", "a")]);
        let first = next_notification(&mut reader).await;
        assert_eq!(first.event_key, "q-a");
        append(&root.join("b.jsonl"), &[&question("q-b", "b")]);
        append(&root.join("c.jsonl"), &[&question("q-c", "c")]);
        tokio::time::sleep(Duration::from_millis(800)).await;

        handle.shutdown();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.notifications_emitted, 3);
        assert_eq!(stats.notifications_held, 2);

        let pending = ledger.unfinished("ui").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, NotificationKind::Rollup);
        assert_eq!(pending[0].notification.rollup_count, Some(2));
        drop(ledger);

        // Second run delivers the saved rollup
        let feed = Arc::new(UiFeed::new(16));
        let mut reader = feed.subscribe();
        let (pipeline, ledger) = start(feed.clone());
        let handle = pipeline.handle();
        let task = tokio::spawn(pipeline.run());

        let rollup = next_notification(&mut reader).await;
        assert_eq!(rollup.kind, NotificationKind::Rollup);
        assert_eq!(rollup.rollup_count, Some(2));
        assert!(rollup.summary.contains("2 question"));

        handle.shutdown();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.messages_applied, 0);
        assert!(ledger.unfinished("ui").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_apply_failures_give_up_on_file() {
        crate::logging::init_test();
        let dir = TempDir::new().unwrap();
        append(&dir.path().join("sess-1.jsonl"), &[HELLO]);

        let mut config = config(dir.path());
        config.monitor.tailer.max_read_failures = 3;
        let feed = Arc::new(UiFeed::new(16));
        let mut reader = feed.subscribe();
        let pipeline = Pipeline::new(
            config,
            Database::open_in_memory().unwrap(),
            Arc::new(NotificationLedger::open_in_memory().unwrap()),
            vec![feed.clone() as Arc<dyn Subscriber>],
        )
        .unwrap();

        // Every message insert now fails
        pipeline
            .store()
            .db()
            .transaction(|tx| {
                tx.execute_batch("DROP TABLE messages")?;
                Ok(())
            })
            .unwrap();

        let handle = pipeline.handle();
        let task = tokio::spawn(pipeline.run());

        let notification = next_notification(&mut reader).await;
        assert_eq!(notification.kind, NotificationKind::SessionFailed);
        assert_eq!(notification.priority, Priority::High);
        assert!(notification.summary.contains("cannot apply line"));

        // Given up: no further attempts
        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.shutdown();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.apply_errors, 3);
        assert_eq!(stats.read_errors, 1);
        assert_eq!(stats.messages_applied, 0);
    }
}
