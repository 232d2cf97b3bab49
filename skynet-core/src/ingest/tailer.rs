//! Incremental reader for one append-only transcript.
//!
//! A [`LogTailer`] resumes from a [`Cursor`], reads whatever was appended
//! since, and returns only whole newline-terminated lines. Bytes after the last
//! terminator stay buffered until the writer finishes the line.
//!
//! The identity marker in the cursor (device, inode, and a digest of the file
//! head) detects truncation and replacement. Either one restarts the file from
//! offset zero under a new generation so sequence positions keep increasing.

use super::Intake;
use crate::error::Result;
use crate::types::{Cursor, FileIdentity};
use sha2::{Digest, Sha256};
use std::fs::{File, Metadata};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Head bytes covered by the rewrite fingerprint
const FINGERPRINT_MAX: usize = 256;

/// Upper bound of bytes pulled from disk per read
const DEFAULT_MAX_CHUNK: usize = 8 * 1024 * 1024;

/// Why a tailer restarted a file from offset zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// The file is shorter than the cursor
    Truncated,
    /// A different file now lives at the path
    Replaced,
    /// Same file, but its head no longer matches what was read
    Rewritten,
}

impl ResetReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetReason::Truncated => "truncated",
            ResetReason::Replaced => "replaced",
            ResetReason::Rewritten => "rewritten",
        }
    }
}

/// One complete line read from a transcript
#[derive(Debug, Clone, PartialEq)]
pub struct TailedLine {
    /// Transcript path
    pub path: PathBuf,
    /// Line content without the terminator
    pub text: String,
    /// Byte offset of the line start
    pub offset: u64,
    /// Cursor positioned right after this line's terminator
    pub cursor: Cursor,
}

/// Result of one read
#[derive(Debug, Clone, PartialEq)]
pub struct TailBatch {
    pub path: PathBuf,
    /// Set when the file restarted from zero before this read
    pub reset: Option<ResetReason>,
    /// Non-blank complete lines, in file order
    pub lines: Vec<TailedLine>,
    /// Cursor after every complete line consumed, blank ones included
    pub cursor: Cursor,
    /// The read stopped at the chunk limit; more data is waiting
    pub more: bool,
    /// Historical content of a file seen for the first time at startup
    pub backfill: bool,
}

impl TailBatch {
    /// Nothing to hand downstream
    pub fn is_noop(&self, previous: &Cursor) -> bool {
        self.reset.is_none() && self.lines.is_empty() && self.cursor == *previous
    }
}

/// Incremental reader for one file
#[derive(Debug)]
pub struct LogTailer {
    path: PathBuf,
    cursor: Cursor,
    /// Bytes after `cursor.offset` with no terminator yet
    partial: Vec<u8>,
    max_chunk: usize,
}

impl LogTailer {
    /// Prepare a tailer; no IO happens until the first read.
    ///
    /// `cursor` is the persisted position, if any. Its identity is verified on
    /// the first read.
    pub fn open(path: impl Into<PathBuf>, cursor: Option<Cursor>) -> Self {
        Self {
            path: path.into(),
            cursor: cursor.unwrap_or_default(),
            partial: Vec::new(),
            max_chunk: DEFAULT_MAX_CHUNK,
        }
    }

    /// Limit how many bytes a single read pulls in
    pub fn with_max_chunk(mut self, max_chunk: usize) -> Self {
        self.max_chunk = max_chunk.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Position after the last complete line handed out
    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    /// Go back to a persisted position (after a failed apply downstream)
    pub fn rewind(&mut self, cursor: Cursor) {
        tracing::debug!(
            path = %self.path.display(),
            from = self.cursor.offset,
            to = cursor.offset,
            "Rewinding tailer"
        );
        self.cursor = cursor;
        self.partial.clear();
    }

    /// Read everything appended since the last call.
    pub fn read_available(&mut self) -> Result<TailBatch> {
        let mut file = File::open(&self.path)?;
        let metadata = file.metadata()?;
        let identity = file_identity(&metadata);
        let size = metadata.len();

        let reset = self.detect_reset(&mut file, identity, size)?;
        if let Some(reason) = reset {
            tracing::info!(
                path = %self.path.display(),
                reason = reason.as_str(),
                old_offset = self.cursor.offset,
                size,
                "Transcript reset, re-reading from offset 0"
            );
            let generation = self.cursor.generation.wrapping_add(1);
            self.cursor = Cursor::fresh(identity, generation);
            self.partial.clear();
        } else {
            self.cursor.identity = identity;
        }

        let read_from = self.cursor.offset + self.partial.len() as u64;
        let mut more = false;
        if size > read_from {
            file.seek(SeekFrom::Start(read_from))?;
            let want = (size - read_from).min(self.max_chunk as u64);
            let mut chunk = Vec::with_capacity(want as usize);
            (&mut file).take(want).read_to_end(&mut chunk)?;
            more = read_from + (chunk.len() as u64) < size;
            self.partial.extend_from_slice(&chunk);
        }

        let lines = self.split_lines();

        Ok(TailBatch {
            path: self.path.clone(),
            reset,
            lines,
            cursor: self.cursor.clone(),
            more,
            backfill: false,
        })
    }

    fn detect_reset(
        &self,
        file: &mut File,
        identity: FileIdentity,
        size: u64,
    ) -> Result<Option<ResetReason>> {
        let known = self.cursor.identity != FileIdentity::default();
        if known && identity != self.cursor.identity {
            return Ok(Some(ResetReason::Replaced));
        }

        let read_pos = self.cursor.offset + self.partial.len() as u64;
        if size < read_pos {
            return Ok(Some(ResetReason::Truncated));
        }

        if let Some(expected) = &self.cursor.fingerprint {
            let len = self.cursor.fingerprint_len as usize;
            let mut head = Vec::with_capacity(len);
            file.seek(SeekFrom::Start(0))?;
            file.by_ref().take(len as u64).read_to_end(&mut head)?;
            if head.len() < len || fingerprint(&head) != *expected {
                return Ok(Some(ResetReason::Rewritten));
            }
        }

        Ok(None)
    }

    /// Cut complete lines off the front of the partial buffer
    fn split_lines(&mut self) -> Vec<TailedLine> {
        let mut lines = Vec::new();
        let mut consumed = 0usize;

        while let Some(pos) = self.partial[consumed..].iter().position(|b| *b == b'\n') {
            let start = self.cursor.offset + consumed as u64;
            let mut raw = &self.partial[consumed..consumed + pos];
            consumed += pos + 1;

            if start == 0 && self.cursor.fingerprint.is_none() && !raw.is_empty() {
                let len = raw.len().min(FINGERPRINT_MAX);
                self.cursor.fingerprint = Some(fingerprint(&raw[..len]));
                self.cursor.fingerprint_len = len as u32;
            }

            if raw.last() == Some(&b'\r') {
                raw = &raw[..raw.len() - 1];
            }

            let end = self.cursor.offset + consumed as u64;
            let text = String::from_utf8_lossy(raw).into_owned();
            if text.trim().is_empty() {
                continue;
            }

            let mut cursor = self.cursor.clone();
            cursor.offset = end;
            lines.push(TailedLine {
                path: self.path.clone(),
                text,
                offset: start,
                cursor,
            });
        }

        self.partial.drain(..consumed);
        self.cursor.offset += consumed as u64;
        lines
    }
}

/// Hex digest used for head fingerprints
pub fn fingerprint(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..16])
}

#[cfg(unix)]
fn file_identity(metadata: &Metadata) -> FileIdentity {
    use std::os::unix::fs::MetadataExt;
    FileIdentity {
        device: metadata.dev(),
        inode: metadata.ino(),
    }
}

#[cfg(not(unix))]
fn file_identity(_metadata: &Metadata) -> FileIdentity {
    // No stable inode; replacement is caught by the head fingerprint instead
    FileIdentity::default()
}

// ============================================
// Async driver
// ============================================

/// Settings shared by every tailer task
#[derive(Debug, Clone)]
pub struct TailerSettings {
    /// Re-read interval when no wake arrives
    pub poll_interval: Duration,
    /// Consecutive failures before the file is reported unreadable
    pub max_read_failures: u32,
}

/// Handle to a spawned tailer task
pub struct TailerHandle {
    wake: Arc<Notify>,
    rewinds: mpsc::UnboundedSender<(Cursor, Duration)>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TailerHandle {
    /// Ask for a re-read; bursts collapse into one pending wake
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Rewind to a persisted cursor and read again after `delay`.
    ///
    /// Never waits, so the pipeline can call it while the tailer is blocked
    /// on a full intake queue.
    pub fn rewind(&self, cursor: Cursor, delay: Duration) {
        let _ = self.rewinds.send((cursor, delay));
    }

    /// Stop after the current read
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the task to exit
    pub async fn join(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Spawn a task that drives `tailer` and feeds the intake queue.
///
/// When `backfill` is set, the first drain of the file is flagged as
/// historical content. The task ends when `parent` is cancelled, the handle is
/// stopped, or the intake queue closes.
pub fn spawn_tailer(
    tailer: LogTailer,
    intake: mpsc::Sender<Intake>,
    settings: TailerSettings,
    backfill: bool,
    parent: &CancellationToken,
) -> TailerHandle {
    let wake = Arc::new(Notify::new());
    let (rewinds, rewind_rx) = mpsc::unbounded_channel();
    let cancel = parent.child_token();
    let task = tokio::spawn(run_tailer(
        tailer,
        Arc::clone(&wake),
        rewind_rx,
        intake,
        settings,
        backfill,
        cancel.clone(),
    ));
    TailerHandle {
        wake,
        rewinds,
        cancel,
        task,
    }
}

async fn run_tailer(
    mut tailer: LogTailer,
    wake: Arc<Notify>,
    mut rewinds: mpsc::UnboundedReceiver<(Cursor, Duration)>,
    intake: mpsc::Sender<Intake>,
    settings: TailerSettings,
    mut backfill: bool,
    cancel: CancellationToken,
) {
    let mut failures = 0u32;
    let mut reported_unreadable = false;
    let mut resume_at: Option<Instant> = None;

    loop {
        if let Some(at) = resume_at.take() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(at) => {}
            }
        }

        // Drain everything currently on disk
        loop {
            while let Ok((cursor, delay)) = rewinds.try_recv() {
                tailer.rewind(cursor);
                resume_at = Some(Instant::now() + delay);
            }
            if resume_at.is_some() {
                break;
            }
            let before = tailer.cursor().clone();
            match tailer.read_available() {
                Ok(mut batch) => {
                    failures = 0;
                    reported_unreadable = false;
                    let more = batch.more;
                    if !batch.is_noop(&before) {
                        batch.backfill = backfill;
                        if !forward(&intake, Intake::Batch(batch), &cancel).await {
                            return;
                        }
                    }
                    if !more {
                        break;
                    }
                }
                Err(crate::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Removal is reported by the directory monitor
                    tracing::debug!(path = %tailer.path().display(), "Transcript vanished");
                    break;
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        path = %tailer.path().display(),
                        error = %e,
                        failures,
                        "Transcript read failed"
                    );
                    if failures >= settings.max_read_failures && !reported_unreadable {
                        reported_unreadable = true;
                        let item = Intake::Unreadable {
                            path: tailer.path().to_path_buf(),
                            error: e.to_string(),
                        };
                        if !forward(&intake, item, &cancel).await {
                            return;
                        }
                    }
                    break;
                }
            }
        }
        if resume_at.is_some() {
            continue;
        }
        backfill = false;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = wake.notified() => {}
            rewind = rewinds.recv() => match rewind {
                Some((cursor, delay)) => {
                    tailer.rewind(cursor);
                    resume_at = Some(Instant::now() + delay);
                }
                None => break,
            },
            _ = tokio::time::sleep(settings.poll_interval) => {}
        }
    }

    tracing::debug!(path = %tailer.path().display(), "Tailer stopped");
}

/// Hand an item to the pipeline; `false` once the task should exit.
///
/// A batch dropped on cancellation was never applied, so its cursor was never
/// persisted and the lines are read again on the next start.
async fn forward(intake: &mpsc::Sender<Intake>, item: Intake, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = intake.send(item) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn append(path: &Path, content: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    fn texts(batch: &TailBatch) -> Vec<&str> {
        batch.lines.iter().map(|l| l.text.as_str()).collect()
    }

    #[test]
    fn test_reads_complete_lines_and_buffers_partial() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        append(&path, "one\ntw");

        let mut tailer = LogTailer::open(&path, None);
        let batch = tailer.read_available().unwrap();
        assert_eq!(texts(&batch), vec!["one"]);
        assert_eq!(batch.cursor.offset, 4);
        assert_eq!(batch.lines[0].offset, 0);
        assert_eq!(batch.lines[0].cursor.offset, 4);

        // Nothing new until the terminator arrives
        let batch = tailer.read_available().unwrap();
        assert!(batch.lines.is_empty());
        assert_eq!(tailer.cursor().offset, 4);

        append(&path, "o\nthree\n");
        let batch = tailer.read_available().unwrap();
        assert_eq!(texts(&batch), vec!["two", "three"]);
        assert_eq!(batch.lines[0].offset, 4);
        assert_eq!(batch.cursor.offset, 14);
    }

    #[test]
    fn test_resume_from_cursor_skips_consumed_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        append(&path, "alpha\nbeta\n");

        let mut first = LogTailer::open(&path, None);
        let batch = first.read_available().unwrap();
        let persisted = batch.cursor.clone();
        assert_eq!(persisted.offset, 11);

        append(&path, "gamma\n");

        let mut resumed = LogTailer::open(&path, Some(persisted));
        let batch = resumed.read_available().unwrap();
        assert_eq!(batch.reset, None);
        assert_eq!(texts(&batch), vec!["gamma"]);
        assert_eq!(batch.lines[0].offset, 11);
    }

    #[test]
    fn test_truncation_restarts_from_zero() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        append(&path, "first line\nsecond line\n");

        let mut tailer = LogTailer::open(&path, None);
        tailer.read_available().unwrap();
        assert_eq!(tailer.cursor().generation, 0);

        std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        append(&path, "new\n");

        let batch = tailer.read_available().unwrap();
        assert_eq!(batch.reset, Some(ResetReason::Truncated));
        assert_eq!(texts(&batch), vec!["new"]);
        assert_eq!(batch.lines[0].offset, 0);
        assert_eq!(batch.cursor.generation, 1);
    }

    #[test]
    fn test_rewrite_with_longer_content_detected_by_fingerprint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        append(&path, "{\"uuid\":\"a\"}\n");

        let mut tailer = LogTailer::open(&path, None);
        tailer.read_available().unwrap();
        assert!(tailer.cursor().fingerprint.is_some());

        // Same inode, longer than before, entirely new content
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.write_all(b"{\"uuid\":\"b\"}\n{\"uuid\":\"c\"}\n").unwrap();
        drop(file);

        let batch = tailer.read_available().unwrap();
        assert_eq!(batch.reset, Some(ResetReason::Rewritten));
        assert_eq!(texts(&batch), vec!["{\"uuid\":\"b\"}", "{\"uuid\":\"c\"}"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_replacement_detected_by_identity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        append(&path, "old one\nold two\n");

        let mut tailer = LogTailer::open(&path, None);
        tailer.read_available().unwrap();

        let replacement = dir.path().join("s.jsonl.tmp");
        append(&replacement, "old one\nold two\nfresh\n");
        std::fs::rename(&replacement, &path).unwrap();

        let batch = tailer.read_available().unwrap();
        assert_eq!(batch.reset, Some(ResetReason::Replaced));
        assert_eq!(texts(&batch), vec!["old one", "old two", "fresh"]);
    }

    #[test]
    fn test_small_chunks_preserve_line_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        let expected: Vec<String> = (0..20).map(|i| format!("line number {}", i)).collect();
        for line in &expected {
            append(&path, &format!("{}\n", line));
        }

        let mut tailer = LogTailer::open(&path, None).with_max_chunk(7);
        let mut seen = Vec::new();
        let mut reads = 0;
        loop {
            let batch = tailer.read_available().unwrap();
            reads += 1;
            seen.extend(batch.lines.iter().map(|l| l.text.clone()));
            if !batch.more {
                break;
            }
        }
        assert!(reads > 20);
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        append(&path, "a\r\n\n   \nb\n\n");

        let mut tailer = LogTailer::open(&path, None);
        let batch = tailer.read_available().unwrap();
        assert_eq!(texts(&batch), vec!["a", "b"]);
        // Blank lines still advance the batch cursor
        assert_eq!(batch.cursor.offset, 11);
        assert_eq!(batch.lines[1].cursor.offset, 10);
    }

    #[tokio::test]
    async fn test_task_reports_unreadable_after_repeated_failures() {
        let dir = TempDir::new().unwrap();
        // A directory cannot be read as a file
        let path = dir.path().join("not-a-file.jsonl");
        std::fs::create_dir(&path).unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let root = CancellationToken::new();
        let handle = spawn_tailer(
            LogTailer::open(&path, None),
            tx,
            TailerSettings {
                poll_interval: Duration::from_millis(5),
                max_read_failures: 3,
            },
            false,
            &root,
        );

        let item = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match item {
            Intake::Unreadable { path: p, .. } => assert_eq!(p, path),
            other => panic!("expected unreadable, got {:?}", other),
        }
        handle.join().await;
    }
}
