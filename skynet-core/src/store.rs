//! Session store: the single authority over sessions, messages and cursors
//!
//! Every change is applied inside one SQLite transaction together with the
//! cursor of the line that caused it. A crash either keeps the line's effects
//! and its cursor, or neither, so a restart resumes exactly where the store
//! left off.
//!
//! Re-applying an event id that is already stored is a no-op: no message is
//! written and no [`Delta`] comes back.

use crate::db::repo::{self, SourceFileRecord};
use crate::db::Database;
use crate::error::Result;
use crate::ingest::{correlate, DomainEvent, EventBody, TailedLine};
use crate::types::{
    Cursor, Delta, MessageKind, SeqPos, Session, SessionStatus, StatusTransition,
    TransitionReason,
};
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Lifecycle thresholds
#[derive(Debug, Clone, Copy)]
pub struct StoreSettings {
    /// Quiet period before `active → idle`
    pub idle_threshold: Duration,
    /// Quiet period before a session is closed
    pub completion_threshold: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::seconds(300),
            completion_threshold: Duration::seconds(3600),
        }
    }
}

/// Counters for what the store did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub messages_applied: u64,
    pub duplicates_skipped: u64,
    pub out_of_order_dropped: u64,
    pub sessions_created: u64,
    pub transitions: u64,
}

impl StoreStats {
    fn add(&mut self, other: &StoreStats) {
        self.messages_applied += other.messages_applied;
        self.duplicates_skipped += other.duplicates_skipped;
        self.out_of_order_dropped += other.out_of_order_dropped;
        self.sessions_created += other.sessions_created;
        self.transitions += other.transitions;
    }
}

#[derive(Debug, Clone)]
struct FileState {
    record: SourceFileRecord,
    /// Highest sequence position applied from this file since startup
    last_seq: Option<SeqPos>,
}

/// Authoritative session state
pub struct SessionStore {
    db: Database,
    settings: StoreSettings,
    sessions: HashMap<String, Session>,
    files: HashMap<PathBuf, FileState>,
    started_at: DateTime<Utc>,
    stats: StoreStats,
}

impl SessionStore {
    /// Load sessions and cursors from `db`.
    ///
    /// `now` marks startup; sweeps of sessions that went quiet before it are
    /// flagged as backfill.
    pub fn open(db: Database, settings: StoreSettings, now: DateTime<Utc>) -> Result<Self> {
        db.migrate()?;

        let sessions: HashMap<String, Session> = db
            .load_sessions()?
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        let files: HashMap<PathBuf, FileState> = db
            .load_source_files()?
            .into_iter()
            .map(|record| {
                (
                    record.path.clone(),
                    FileState {
                        record,
                        last_seq: None,
                    },
                )
            })
            .collect();

        tracing::info!(
            sessions = sessions.len(),
            files = files.len(),
            "Session store loaded"
        );

        Ok(Self {
            db,
            settings,
            sessions,
            files,
            started_at: now,
            stats: StoreStats::default(),
        })
    }

    /// Read-side access to the underlying database
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn stats(&self) -> StoreStats {
        self.stats
    }

    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Persisted cursor for `path`, if the file was read before
    pub fn cursor(&self, path: &Path) -> Option<Cursor> {
        self.files.get(path).map(|f| f.record.cursor.clone())
    }

    /// Session a line of `path` belongs to.
    ///
    /// A bound file keeps its session. Otherwise the record's own session id
    /// is used, falling back to the file stem.
    pub fn resolve_session(&self, path: &Path, record_session: Option<&str>) -> String {
        if let Some(bound) = self
            .files
            .get(path)
            .and_then(|f| f.record.session_id.as_deref())
        {
            return bound.to_string();
        }
        record_session
            .map(String::from)
            .unwrap_or_else(|| file_stem(path))
    }

    /// Apply a single event outside of any line (no cursor is saved).
    pub fn apply_at(&mut self, event: &DomainEvent, now: DateTime<Utc>) -> Result<Option<Delta>> {
        let path = event.source_path.clone();
        let mut deltas = self.apply_events(&path, std::slice::from_ref(event), None, false, now)?;
        Ok(deltas.pop())
    }

    /// Apply every event of one line and persist the line's cursor, atomically.
    pub fn apply_line(
        &mut self,
        line: &TailedLine,
        events: &[DomainEvent],
        backfill: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<Delta>> {
        self.apply_events(&line.path, events, Some(&line.cursor), backfill, now)
    }

    fn apply_events(
        &mut self,
        path: &Path,
        events: &[DomainEvent],
        cursor: Option<&Cursor>,
        backfill: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<Delta>> {
        let file = self
            .files
            .get(path)
            .cloned()
            .unwrap_or_else(|| FileState {
                record: SourceFileRecord {
                    path: path.to_path_buf(),
                    session_id: None,
                    cursor: Cursor::default(),
                    removed: false,
                    updated_at: now,
                },
                last_seq: None,
            });

        let mut staged: HashMap<String, Session> = HashMap::new();
        let mut stats = StoreStats::default();
        let mut record = file.record.clone();
        let mut last_seq = file.last_seq;
        let sessions = &self.sessions;

        let deltas = self.db.transaction(|tx| {
            let mut deltas = Vec::new();
            for event in events {
                if last_seq.is_some_and(|prev| event.seq <= prev) {
                    stats.out_of_order_dropped += 1;
                    tracing::debug!(event_id = %event.event_id, seq = %event.seq, "Dropping out-of-order event");
                    continue;
                }
                last_seq = Some(event.seq);

                if record.session_id.is_none() && event.body == EventBody::SessionMetadata {
                    record.session_id = Some(event.session_id.clone());
                }

                let mut applier = Applier {
                    conn: tx,
                    sessions,
                    staged: &mut staged,
                    stats: &mut stats,
                    now,
                };
                if let Some(mut delta) = applier.apply(event)? {
                    delta.backfill = backfill;
                    deltas.push(delta);
                }
            }

            if let Some(cursor) = cursor {
                for session in staged.values_mut() {
                    session.cursor_offset = cursor.offset;
                }
                record.cursor = cursor.clone();
                record.removed = false;
                record.updated_at = now;
                repo::save_source_file(tx, &record)?;
            }
            for session in staged.values() {
                repo::upsert_session(tx, session)?;
            }
            Ok(deltas)
        })?;

        // Committed: publish the staged state
        self.sessions.extend(staged);
        self.files.insert(path.to_path_buf(), FileState { record, last_seq });
        self.stats.add(&stats);
        Ok(deltas)
    }

    /// Persist a cursor that advanced without any applied event
    /// (blank lines, undecodable lines, a reset to an empty file).
    pub fn save_cursor(&mut self, path: &Path, cursor: &Cursor, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.files.get(path).cloned().unwrap_or_else(|| FileState {
            record: SourceFileRecord {
                path: path.to_path_buf(),
                session_id: None,
                cursor: Cursor::default(),
                removed: false,
                updated_at: now,
            },
            last_seq: None,
        });
        if state.record.cursor == *cursor && !state.record.removed {
            return Ok(());
        }
        state.record.cursor = cursor.clone();
        state.record.removed = false;
        state.record.updated_at = now;
        self.db
            .transaction(|tx| repo::save_source_file(tx, &state.record))?;
        self.files.insert(path.to_path_buf(), state);
        Ok(())
    }

    /// The file restarted from offset zero; forget what was read from it.
    ///
    /// The binding is dropped so a rewritten file may name a different
    /// session. Messages already stored stay.
    pub fn reset_file(&mut self, path: &Path) {
        if let Some(state) = self.files.get_mut(path) {
            state.record.session_id = None;
            state.last_seq = None;
        }
    }

    /// Time-based status sweep: `active → idle`, and closing long-quiet sessions.
    ///
    /// Returns one delta per transition. A session only transitions once per
    /// quiet period, so repeated sweeps yield nothing new.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Result<Vec<Delta>> {
        let mut changed = Vec::new();

        for session in self.sessions.values() {
            if !session.status.is_open() {
                continue;
            }
            let quiet = now - session.last_activity_at;

            let (to, reason, due) = if quiet >= self.settings.completion_threshold {
                let to = if session.last_was_error {
                    SessionStatus::Failed
                } else {
                    SessionStatus::Completed
                };
                (
                    to,
                    TransitionReason::CompletionThreshold,
                    session.last_activity_at + self.settings.completion_threshold,
                )
            } else if session.status == SessionStatus::Active
                && quiet >= self.settings.idle_threshold
            {
                (
                    SessionStatus::Idle,
                    TransitionReason::QuietPeriod,
                    session.last_activity_at + self.settings.idle_threshold,
                )
            } else {
                continue;
            };

            if !session.status.can_transition_to(to) {
                continue;
            }

            let mut updated = session.clone();
            let transition = StatusTransition {
                from: session.status,
                to,
                reason,
            };
            updated.status = to;
            updated.updated_at = updated.updated_at.max(now);

            let mut delta = delta_for(&updated, now);
            delta.transition = Some(transition);
            // The transition was already due before this process started
            delta.backfill = due < self.started_at;
            changed.push((updated, delta));
        }

        if changed.is_empty() {
            return Ok(Vec::new());
        }

        self.db.transaction(|tx| {
            for (session, _) in &changed {
                repo::upsert_session(tx, session)?;
            }
            Ok(())
        })?;

        let mut deltas = Vec::with_capacity(changed.len());
        for (session, delta) in changed {
            tracing::debug!(
                session_id = %session.id,
                status = %session.status,
                backfill = delta.backfill,
                "Sweep transition"
            );
            self.sessions.insert(session.id.clone(), session);
            deltas.push(delta);
        }
        self.stats.transitions += deltas.len() as u64;
        Ok(deltas)
    }

    /// The transcript at `path` is gone: close its session.
    pub fn file_removed(&mut self, path: &Path, now: DateTime<Utc>) -> Result<Option<Delta>> {
        let Some(mut state) = self.files.get(path).cloned() else {
            return Ok(None);
        };
        state.record.removed = true;
        state.record.updated_at = now;

        let session_id = state
            .record
            .session_id
            .clone()
            .unwrap_or_else(|| file_stem(path));
        let closed = self.sessions.get(&session_id).and_then(|session| {
            let to = if session.last_was_error {
                SessionStatus::Failed
            } else {
                SessionStatus::Completed
            };
            session
                .status
                .can_transition_to(to)
                .then(|| close(session, to, TransitionReason::FileRemoved, now))
        });

        self.db.transaction(|tx| {
            repo::save_source_file(tx, &state.record)?;
            if let Some((session, _)) = &closed {
                repo::upsert_session(tx, session)?;
            }
            Ok(())
        })?;

        self.files.insert(path.to_path_buf(), state);
        tracing::info!(path = %path.display(), session_id = %session_id, "Transcript removed");
        Ok(closed.map(|(session, delta)| {
            self.sessions.insert(session.id.clone(), session);
            self.stats.transitions += 1;
            delta
        }))
    }

    /// The transcript at `path` stayed unreadable: fail its session.
    pub fn file_unreadable(
        &mut self,
        path: &Path,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Delta>> {
        let session_id = self.resolve_session(path, None);
        let (session, created) = match self.sessions.get(&session_id) {
            Some(s) => (s.clone(), false),
            None => (new_session(&session_id, None, path, now, now), true),
        };
        if !session.status.can_transition_to(SessionStatus::Failed) {
            return Ok(None);
        }

        let (mut session, mut delta) =
            close(&session, SessionStatus::Failed, TransitionReason::FileUnreadable, now);
        session.last_was_error = true;
        delta.session_created = created;
        delta.detail = Some(error.to_string());

        self.db
            .transaction(|tx| repo::upsert_session(tx, &session))?;
        tracing::warn!(path = %path.display(), session_id = %session_id, error, "Transcript unreadable, session failed");

        self.sessions.insert(session.id.clone(), session);
        self.stats.transitions += 1;
        if created {
            self.stats.sessions_created += 1;
        }
        Ok(Some(delta))
    }
}

/// Applies events of one line inside a transaction, staging session changes
struct Applier<'a> {
    conn: &'a Connection,
    sessions: &'a HashMap<String, Session>,
    staged: &'a mut HashMap<String, Session>,
    stats: &'a mut StoreStats,
    now: DateTime<Utc>,
}

impl Applier<'_> {
    fn apply(&mut self, event: &DomainEvent) -> Result<Option<Delta>> {
        let created = self.ensure_session(event)?;
        let now = self.now;

        let change = match &event.body {
            EventBody::SessionMetadata => {
                if let Some(session) = self.staged.get_mut(&event.session_id) {
                    if session.cwd.is_none() && event.cwd.is_some() {
                        session.cwd = event.cwd.clone();
                        session.updated_at = session.updated_at.max(now);
                    }
                }
                None
            }
            EventBody::Message(message) => self.apply_message(event, message.clone())?,
            EventBody::TerminalError { detail } => self.apply_terminal_error(event, detail),
        };

        let delta = match change {
            Some(mut delta) => {
                delta.session_created = created;
                Some(delta)
            }
            None if created => self.staged.get(&event.session_id).map(|session| {
                let mut delta = delta_for(session, event.timestamp);
                delta.session_created = true;
                delta
            }),
            None => None,
        };

        if let Some(d) = &delta {
            if d.session_created {
                self.stats.sessions_created += 1;
            }
            if d.transition.is_some() {
                self.stats.transitions += 1;
            }
        }
        Ok(delta)
    }

    fn apply_message(
        &mut self,
        event: &DomainEvent,
        mut message: crate::types::Message,
    ) -> Result<Option<Delta>> {
        if message.kind == MessageKind::ToolResult {
            let pending = repo::uncorrelated_invocations(self.conn, &message.session_id)?;
            message.correlates_to = correlate(&pending, message.tool_use_id.as_deref());
        }

        if !repo::insert_message(self.conn, &message)? {
            self.stats.duplicates_skipped += 1;
            return Ok(None);
        }
        self.stats.messages_applied += 1;

        let Some(session) = self.staged.get_mut(&event.session_id) else {
            return Ok(None);
        };
        if session.cwd.is_none() {
            session.cwd = event.cwd.clone();
        }

        let transition = match session.status {
            SessionStatus::Discovered => Some(TransitionReason::FirstMessage),
            SessionStatus::Idle => Some(TransitionReason::Reactivated),
            _ => None,
        }
        .map(|reason| StatusTransition {
            from: session.status,
            to: SessionStatus::Active,
            reason,
        });

        // Closed sessions only record the message
        if session.status.is_open() {
            if let Some(t) = &transition {
                session.status = t.to;
            }
            session.last_activity_at = session
                .last_activity_at
                .max(message.timestamp.min(self.now));
            session.last_event_id = Some(message.event_id.clone());
            session.last_message_kind = Some(message.kind);
            session.last_was_error = message.kind == MessageKind::ToolResult && message.is_error;
        }
        session.updated_at = session.updated_at.max(self.now);

        let mut delta = delta_for(session, message.timestamp);
        delta.transition = transition;
        delta.message = Some(message);
        Ok(Some(delta))
    }

    fn apply_terminal_error(&mut self, event: &DomainEvent, detail: &str) -> Option<Delta> {
        let session = self.staged.get_mut(&event.session_id)?;
        if !session.status.can_transition_to(SessionStatus::Failed) {
            return None;
        }
        let transition = StatusTransition {
            from: session.status,
            to: SessionStatus::Failed,
            reason: TransitionReason::TerminalError,
        };
        session.status = SessionStatus::Failed;
        session.last_was_error = true;
        session.updated_at = session.updated_at.max(self.now);

        let mut delta = delta_for(session, event.timestamp);
        delta.transition = Some(transition);
        delta.detail = Some(detail.to_string());
        Some(delta)
    }

    /// Stage the event's session; returns whether it was created.
    ///
    /// A new session row is written at once so messages can reference it.
    fn ensure_session(&mut self, event: &DomainEvent) -> Result<bool> {
        if self.staged.contains_key(&event.session_id) {
            return Ok(false);
        }
        let (session, created) = match self.sessions.get(&event.session_id) {
            Some(existing) => (existing.clone(), false),
            None => (
                new_session(
                    &event.session_id,
                    event.cwd.clone(),
                    &event.source_path,
                    event.timestamp.min(self.now),
                    self.now,
                ),
                true,
            ),
        };
        if created {
            repo::upsert_session(self.conn, &session)?;
        }
        self.staged.insert(event.session_id.clone(), session);
        Ok(created)
    }
}

fn new_session(
    id: &str,
    cwd: Option<String>,
    path: &Path,
    last_activity_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Session {
    Session {
        id: id.to_string(),
        cwd,
        status: SessionStatus::Discovered,
        created_at: now,
        updated_at: now,
        last_activity_at,
        source_path: path.to_path_buf(),
        cursor_offset: 0,
        last_event_id: None,
        last_message_kind: None,
        last_was_error: false,
    }
}

/// Move `session` to a closing status
fn close(
    session: &Session,
    to: SessionStatus,
    reason: TransitionReason,
    now: DateTime<Utc>,
) -> (Session, Delta) {
    let mut updated = session.clone();
    updated.status = to;
    updated.updated_at = updated.updated_at.max(now);
    let mut delta = delta_for(&updated, now);
    delta.transition = Some(StatusTransition {
        from: session.status,
        to,
        reason,
    });
    (updated, delta)
}

fn delta_for(session: &Session, occurred_at: DateTime<Utc>) -> Delta {
    let mut delta = Delta::new(&session.id, occurred_at);
    delta.cwd = session.cwd.clone();
    delta.last_message_kind = session.last_message_kind;
    delta.last_event_id = session.last_event_id.clone();
    delta
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FileIdentity, Message};

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn store(now: DateTime<Utc>) -> SessionStore {
        let db = Database::open_in_memory().unwrap();
        SessionStore::open(
            db,
            StoreSettings {
                idle_threshold: Duration::seconds(60),
                completion_threshold: Duration::seconds(600),
            },
            now,
        )
        .unwrap()
    }

    fn message_event(id: &str, kind: MessageKind, offset: u64, at: DateTime<Utc>) -> DomainEvent {
        let path = PathBuf::from("/p/s1.jsonl");
        let seq = SeqPos {
            generation: 0,
            offset,
            index: 0,
        };
        DomainEvent {
            event_id: id.to_string(),
            session_id: "s1".to_string(),
            cwd: Some("/work/proj".to_string()),
            seq,
            timestamp: at,
            source_path: path.clone(),
            body: EventBody::Message(Message {
                event_id: id.to_string(),
                session_id: "s1".to_string(),
                kind,
                text: Some("hi".to_string()),
                tool_name: None,
                tool_input: None,
                tool_use_id: None,
                is_error: false,
                correlates_to: None,
                seq,
                timestamp: at,
                source_path: path,
            }),
        }
    }

    fn line(offset_after: u64) -> TailedLine {
        TailedLine {
            path: PathBuf::from("/p/s1.jsonl"),
            text: String::new(),
            offset: 0,
            cursor: Cursor {
                offset: offset_after,
                identity: FileIdentity { device: 1, inode: 2 },
                fingerprint: None,
                fingerprint_len: 0,
                generation: 0,
            },
        }
    }

    #[test]
    fn test_apply_is_idempotent() {
        let now = ts("2025-01-01T10:00:00Z");
        let mut store = store(now);
        let event = message_event("e1", MessageKind::User, 0, now);

        let delta = store.apply_at(&event, now).unwrap().unwrap();
        assert!(delta.session_created);
        assert_eq!(
            delta.transition.map(|t| t.to),
            Some(SessionStatus::Active)
        );

        // Same event id at a later position: only the event-id upsert can reject it
        let again = message_event("e1", MessageKind::User, 10, now);
        assert!(store.apply_at(&again, now).unwrap().is_none());
        assert_eq!(store.db().count_messages().unwrap(), 1);
        assert_eq!(store.stats().duplicates_skipped, 1);
        assert_eq!(store.stats().out_of_order_dropped, 0);
        assert_eq!(store.stats().messages_applied, 1);
    }

    #[test]
    fn test_first_message_of_new_session_on_disk() {
        let temp = tempfile::TempDir::new().unwrap();
        let db_path = temp.path().join("state.db");
        let now = ts("2025-01-01T10:00:00Z");

        let mut store =
            SessionStore::open(Database::open(&db_path).unwrap(), StoreSettings::default(), now)
                .unwrap();
        let deltas = store
            .apply_line(&line(42), &[message_event("e1", MessageKind::User, 0, now)], false, now)
            .unwrap();
        assert_eq!(deltas.len(), 1);
        assert!(deltas[0].session_created);

        let reader = Database::open_read_only(&db_path).unwrap();
        let session = reader.get_session("s1").unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.last_event_id.as_deref(), Some("e1"));
        assert_eq!(reader.count_session_messages("s1").unwrap(), 1);
    }

    #[test]
    fn test_apply_line_persists_cursor_with_effects() {
        let now = ts("2025-01-01T10:00:00Z");
        let mut store = store(now);
        let event = message_event("e1", MessageKind::User, 0, now);

        store.apply_line(&line(42), &[event], false, now).unwrap();

        let record = store
            .db()
            .get_source_file(Path::new("/p/s1.jsonl"))
            .unwrap()
            .unwrap();
        assert_eq!(record.cursor.offset, 42);
        assert_eq!(store.session("s1").unwrap().cursor_offset, 42);
        assert_eq!(store.cursor(Path::new("/p/s1.jsonl")).unwrap().offset, 42);
    }

    #[test]
    fn test_out_of_order_events_are_dropped() {
        let now = ts("2025-01-01T10:00:00Z");
        let mut store = store(now);
        store
            .apply_line(&line(20), &[message_event("e2", MessageKind::User, 10, now)], false, now)
            .unwrap();
        let deltas = store
            .apply_line(&line(10), &[message_event("e1", MessageKind::User, 0, now)], false, now)
            .unwrap();
        assert!(deltas.is_empty());
        assert_eq!(store.stats().out_of_order_dropped, 1);
    }

    #[test]
    fn test_idle_sweep_fires_once_then_reactivates() {
        let start = ts("2025-01-01T10:00:00Z");
        let mut store = store(start);
        store
            .apply_at(&message_event("e1", MessageKind::AssistantText, 0, start), start)
            .unwrap();

        assert!(store.sweep(start + Duration::seconds(30)).unwrap().is_empty());

        let deltas = store.sweep(start + Duration::seconds(61)).unwrap();
        assert_eq!(deltas.len(), 1);
        let t = deltas[0].transition.unwrap();
        assert_eq!((t.from, t.to), (SessionStatus::Active, SessionStatus::Idle));
        assert_eq!(deltas[0].last_message_kind, Some(MessageKind::AssistantText));
        assert!(!deltas[0].backfill);

        assert!(store.sweep(start + Duration::seconds(120)).unwrap().is_empty());

        let later = start + Duration::seconds(130);
        let delta = store
            .apply_at(&message_event("e2", MessageKind::User, 10, later), later)
            .unwrap()
            .unwrap();
        assert_eq!(
            delta.transition.map(|t| (t.to, t.reason)),
            Some((SessionStatus::Active, TransitionReason::Reactivated))
        );
    }

    #[test]
    fn test_completion_and_error_closing() {
        let start = ts("2025-01-01T10:00:00Z");
        let mut store = store(start);
        store
            .apply_at(&message_event("e1", MessageKind::User, 0, start), start)
            .unwrap();

        let deltas = store.sweep(start + Duration::seconds(700)).unwrap();
        assert_eq!(deltas[0].transition.unwrap().to, SessionStatus::Completed);

        // A closed session still records messages but does not reopen
        let later = start + Duration::seconds(800);
        let delta = store
            .apply_at(&message_event("e2", MessageKind::User, 10, later), later)
            .unwrap()
            .unwrap();
        assert!(delta.transition.is_none());
        assert_eq!(store.session("s1").unwrap().status, SessionStatus::Completed);
    }

    #[test]
    fn test_terminal_error_fails_session() {
        let now = ts("2025-01-01T10:00:00Z");
        let mut store = store(now);
        store
            .apply_at(&message_event("e1", MessageKind::User, 0, now), now)
            .unwrap();

        let mut event = message_event("e1#error", MessageKind::User, 10, now);
        event.body = EventBody::TerminalError {
            detail: "API Error: 500".to_string(),
        };
        let delta = store.apply_at(&event, now).unwrap().unwrap();
        assert_eq!(delta.transition.unwrap().to, SessionStatus::Failed);
        assert_eq!(delta.detail.as_deref(), Some("API Error: 500"));

        // Failed is final
        event.seq.offset = 20;
        assert!(store.apply_at(&event, now).unwrap().is_none());
    }

    #[test]
    fn test_sweep_of_sessions_quiet_before_startup_is_backfill() {
        let old = ts("2025-01-01T08:00:00Z");
        let mut first = store(old);
        first
            .apply_at(&message_event("e1", MessageKind::User, 0, old), old)
            .unwrap();
        let db = std::mem::replace(&mut first.db, Database::open_in_memory().unwrap());

        let restart = ts("2025-01-01T12:00:00Z");
        let mut second = SessionStore::open(db, StoreSettings::default(), restart).unwrap();
        let deltas = second.sweep(restart).unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].transition.unwrap().to, SessionStatus::Completed);
        assert!(deltas[0].backfill);
    }

    #[test]
    fn test_file_removed_and_unreadable() {
        let now = ts("2025-01-01T10:00:00Z");
        let mut store = store(now);
        let mut meta = message_event("e1#meta", MessageKind::User, 0, now);
        meta.body = EventBody::SessionMetadata;
        let mut first = message_event("e1", MessageKind::User, 0, now);
        first.seq.index = 1;
        store.apply_line(&line(10), &[meta, first], false, now).unwrap();

        let delta = store
            .file_removed(Path::new("/p/s1.jsonl"), now)
            .unwrap()
            .unwrap();
        let t = delta.transition.unwrap();
        assert_eq!((t.to, t.reason), (SessionStatus::Completed, TransitionReason::FileRemoved));

        let delta = store
            .file_unreadable(Path::new("/p/other.jsonl"), "permission denied", now)
            .unwrap()
            .unwrap();
        assert!(delta.session_created);
        assert_eq!(delta.session_id, "other");
        assert_eq!(delta.transition.unwrap().to, SessionStatus::Failed);
    }

    #[test]
    fn test_tool_result_correlates_to_nearest_invocation() {
        let now = ts("2025-01-01T10:00:00Z");
        let mut store = store(now);
        store
            .apply_at(&message_event("inv", MessageKind::ToolInvocation, 0, now), now)
            .unwrap();
        let delta = store
            .apply_at(&message_event("res", MessageKind::ToolResult, 10, now), now)
            .unwrap()
            .unwrap();
        assert_eq!(
            delta.message.unwrap().correlates_to.as_deref(),
            Some("inv")
        );
    }
}
