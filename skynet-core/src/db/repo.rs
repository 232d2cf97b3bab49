//! Database repository layer
//!
//! `Database` wraps one SQLite connection. The ingestion pipeline owns the
//! writable handle; external readers (UI/API layers, `skynet-query`) open their
//! own read-only handle and only ever see committed snapshots (WAL mode).
//!
//! Write helpers that must run inside a store transaction are free functions
//! over `&Connection` so a single transaction can cover a line's messages,
//! session updates and cursor advance.

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, Transaction};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Persisted per-file ingestion state
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFileRecord {
    /// Transcript path (primary key)
    pub path: PathBuf,
    /// Session the file is bound to, once known
    pub session_id: Option<String>,
    /// Read position
    pub cursor: Cursor,
    /// The file disappeared from disk
    pub removed: bool,
    /// Last time the row changed
    pub updated_at: DateTime<Utc>,
}

/// Filter for the session query surface
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Filter by status
    pub status: Option<SessionStatus>,
    /// Only sessions updated at or after this time
    pub since: Option<DateTime<Utc>>,
    /// Only sessions updated before this time
    pub until: Option<DateTime<Utc>>,
    /// Maximum number of sessions to return
    pub limit: Option<usize>,
}

/// Database handle (single connection)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable foreign keys and WAL mode so readers never block the writer
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA cache_size = -16000;  -- 16MB cache
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an existing database for reading only.
    ///
    /// Fails with a configuration error when the file has never been
    /// initialised by the ingestion process.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Config(format!(
                "database {} does not exist; run skynet-sync or skynet first",
                path.display()
            )));
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch("PRAGMA query_only = ON; PRAGMA busy_timeout = 5000;")?;

        let version = super::schema::get_schema_version(&conn)?;
        if version == 0 || version > super::schema::SCHEMA_VERSION {
            return Err(Error::Config(format!(
                "database {} has unsupported schema version {}",
                path.display(),
                version
            )));
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing and ephemeral runs)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        super::schema::run_migrations(&conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }

    /// Run `f` inside one transaction; commits on `Ok`, rolls back on `Err`.
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // ============================================
    // Source file (cursor) operations
    // ============================================

    /// Get the persisted state of one file
    pub fn get_source_file(&self, path: &Path) -> Result<Option<SourceFileRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT * FROM source_files WHERE path = ?",
            [path.to_string_lossy().to_string()],
            row_to_source_file,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Load every persisted cursor.
    ///
    /// A row that cannot be decoded means the store is corrupt, which is a
    /// startup configuration error rather than something to paper over.
    pub fn load_source_files(&self) -> Result<Vec<SourceFileRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM source_files ORDER BY path")?;
        let rows = stmt
            .query_map([], row_to_source_file)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Config(format!("invalid persisted cursor store: {}", e)))?;
        Ok(rows)
    }

    // ============================================
    // Session operations
    // ============================================

    /// Get a session by ID
    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.lock()?;
        conn.query_row("SELECT * FROM sessions WHERE id = ?", [id], row_to_session)
            .optional()
            .map_err(Error::from)
    }

    /// Load every session (store warm-up)
    pub fn load_sessions(&self) -> Result<Vec<Session>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM sessions")?;
        let sessions = stmt
            .query_map([], row_to_session)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    /// List sessions with optional filtering, most recently updated first
    pub fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>> {
        let conn = self.lock()?;

        let mut sql = String::from("SELECT * FROM sessions WHERE 1=1");
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];

        if let Some(status) = &filter.status {
            sql.push_str(" AND status = ?");
            params.push(Box::new(status.as_str().to_string()));
        }

        if let Some(since) = &filter.since {
            sql.push_str(" AND updated_at >= ?");
            params.push(Box::new(since.to_rfc3339()));
        }

        if let Some(until) = &filter.until {
            sql.push_str(" AND updated_at < ?");
            params.push(Box::new(until.to_rfc3339()));
        }

        sql.push_str(" ORDER BY updated_at DESC, id ASC");

        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn.prepare(&sql)?;
        let sessions = stmt
            .query_map(params_refs.as_slice(), row_to_session)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(sessions)
    }

    // ============================================
    // Message operations
    // ============================================

    /// Messages of a session in sequence order
    pub fn get_session_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM messages WHERE session_id = ?
             ORDER BY seq_generation ASC, seq_offset ASC, seq_index ASC
             LIMIT ?",
        )?;

        let messages = stmt
            .query_map(params![session_id, limit as i64], row_to_message)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(messages)
    }

    /// Count messages for a session
    pub fn count_session_messages(&self, session_id: &str) -> Result<i64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Count all messages
    pub fn count_messages(&self) -> Result<i64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count)
    }

    // ============================================
    // Notification record operations
    // ============================================

    /// Insert a pending record unless one already exists for `(event_key, channel)`.
    ///
    /// Returns the state of the record that is now stored: `Pending` for a
    /// fresh insert, otherwise whatever the earlier run left behind.
    pub fn insert_notification_record(
        &self,
        notification: &Notification,
        channel: &str,
        now: DateTime<Utc>,
    ) -> Result<DeliveryState> {
        let conn = self.lock()?;
        let payload = serde_json::to_string(notification)?;
        let inserted = conn.execute(
            r#"
            INSERT INTO notification_records (event_key, channel, state, kind, attempts,
                                              emitted_at, updated_at, payload)
            VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5, ?6)
            ON CONFLICT(event_key, channel) DO NOTHING
            "#,
            params![
                notification.event_key,
                channel,
                DeliveryState::Pending.as_str(),
                notification.kind.as_str(),
                now.to_rfc3339(),
                payload,
            ],
        )?;

        if inserted == 1 {
            return Ok(DeliveryState::Pending);
        }

        let state: String = conn.query_row(
            "SELECT state FROM notification_records WHERE event_key = ? AND channel = ?",
            params![notification.event_key, channel],
            |row| row.get(0),
        )?;
        state.parse().map_err(Error::Config)
    }

    /// Move a record to a new state, bumping attempts when an attempt starts
    pub fn update_notification_state(
        &self,
        event_key: &str,
        channel: &str,
        state: DeliveryState,
        last_error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            UPDATE notification_records
            SET state = ?3,
                attempts = attempts + CASE WHEN ?3 = 'in_flight' THEN 1 ELSE 0 END,
                last_error = COALESCE(?4, last_error),
                updated_at = ?5
            WHERE event_key = ?1 AND channel = ?2
            "#,
            params![event_key, channel, state.as_str(), last_error, now.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Get one record
    pub fn get_notification_record(
        &self,
        event_key: &str,
        channel: &str,
    ) -> Result<Option<NotificationRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT * FROM notification_records WHERE event_key = ? AND channel = ?",
            params![event_key, channel],
            row_to_notification_record,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Records a restart must retry (pending or in flight), oldest first
    pub fn unfinished_notification_records(&self, channel: &str) -> Result<Vec<NotificationRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM notification_records
             WHERE channel = ? AND state IN ('pending', 'in_flight')
             ORDER BY id ASC",
        )?;
        let records = stmt
            .query_map([channel], row_to_notification_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Most recent records across channels
    pub fn recent_notification_records(&self, limit: usize) -> Result<Vec<NotificationRecord>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT * FROM notification_records ORDER BY id DESC LIMIT ?")?;
        let records = stmt
            .query_map([limit as i64], row_to_notification_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

// ============================================
// Transaction-scoped writes (used by the session store)
// ============================================

/// Persist a file's cursor and session binding
pub fn save_source_file(conn: &Connection, record: &SourceFileRecord) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO source_files (path, session_id, byte_offset, device, inode, fingerprint,
                                  fingerprint_len, generation, removed, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(path) DO UPDATE SET
            session_id = excluded.session_id,
            byte_offset = excluded.byte_offset,
            device = excluded.device,
            inode = excluded.inode,
            fingerprint = excluded.fingerprint,
            fingerprint_len = excluded.fingerprint_len,
            generation = excluded.generation,
            removed = excluded.removed,
            updated_at = excluded.updated_at
        "#,
        params![
            record.path.to_string_lossy().to_string(),
            record.session_id,
            record.cursor.offset as i64,
            record.cursor.identity.device as i64,
            record.cursor.identity.inode as i64,
            record.cursor.fingerprint,
            record.cursor.fingerprint_len,
            record.cursor.generation,
            record.removed,
            record.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Insert or update a session
pub fn upsert_session(conn: &Connection, session: &Session) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO sessions (id, cwd, status, created_at, updated_at, last_activity_at,
                              source_path, cursor_offset, last_event_id, last_message_kind,
                              last_was_error)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(id) DO UPDATE SET
            cwd = COALESCE(excluded.cwd, sessions.cwd),
            status = excluded.status,
            updated_at = MAX(sessions.updated_at, excluded.updated_at),
            last_activity_at = MAX(sessions.last_activity_at, excluded.last_activity_at),
            source_path = excluded.source_path,
            cursor_offset = excluded.cursor_offset,
            last_event_id = excluded.last_event_id,
            last_message_kind = excluded.last_message_kind,
            last_was_error = excluded.last_was_error
        "#,
        params![
            session.id,
            session.cwd,
            session.status.as_str(),
            session.created_at.to_rfc3339(),
            session.updated_at.to_rfc3339(),
            session.last_activity_at.to_rfc3339(),
            session.source_path.to_string_lossy().to_string(),
            session.cursor_offset as i64,
            session.last_event_id,
            session.last_message_kind.map(|k| k.as_str()),
            session.last_was_error,
        ],
    )?;
    Ok(())
}

/// Insert a message; returns `false` when the event id was already stored
pub fn insert_message(conn: &Connection, message: &Message) -> Result<bool> {
    let inserted = conn.execute(
        r#"
        INSERT INTO messages (event_id, session_id, kind, text, tool_name, tool_input,
                              tool_use_id, is_error, correlates_to, seq_generation,
                              seq_offset, seq_index, ts, source_path)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        ON CONFLICT(event_id) DO NOTHING
        "#,
        params![
            message.event_id,
            message.session_id,
            message.kind.as_str(),
            message.text,
            message.tool_name,
            message.tool_input.as_ref().map(|v| v.to_string()),
            message.tool_use_id,
            message.is_error,
            message.correlates_to,
            message.seq.generation,
            message.seq.offset as i64,
            message.seq.index,
            message.timestamp.to_rfc3339(),
            message.source_path.to_string_lossy().to_string(),
        ],
    )?;
    Ok(inserted == 1)
}

/// Tool invocations of a session no tool result points at yet, in sequence order.
///
/// Returns `(event_id, tool_use_id)` pairs.
pub fn uncorrelated_invocations(
    conn: &Connection,
    session_id: &str,
) -> Result<Vec<(String, Option<String>)>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT m.event_id, m.tool_use_id FROM messages m
        WHERE m.session_id = ?1
          AND m.kind = 'tool-invocation'
          AND NOT EXISTS (
              SELECT 1 FROM messages r
              WHERE r.session_id = ?1 AND r.correlates_to = m.event_id
          )
        ORDER BY m.seq_generation ASC, m.seq_offset ASC, m.seq_index ASC
        "#,
    )?;
    let rows = stmt
        .query_map([session_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ============================================
// Row mappers
// ============================================

fn parse_ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

fn conversion_error(column: &str, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("{}: {}", column, message).into(),
    )
}

fn row_to_source_file(row: &Row) -> rusqlite::Result<SourceFileRecord> {
    let path: String = row.get("path")?;
    let offset: i64 = row.get("byte_offset")?;
    let device: i64 = row.get("device")?;
    let inode: i64 = row.get("inode")?;
    let updated_at: String = row.get("updated_at")?;

    if offset < 0 {
        return Err(conversion_error(
            "byte_offset",
            format!("negative offset {} for {}", offset, path),
        ));
    }

    Ok(SourceFileRecord {
        path: PathBuf::from(path),
        session_id: row.get("session_id")?,
        cursor: Cursor {
            offset: offset as u64,
            identity: FileIdentity {
                device: device as u64,
                inode: inode as u64,
            },
            fingerprint: row.get("fingerprint")?,
            fingerprint_len: row.get("fingerprint_len")?,
            generation: row.get("generation")?,
        },
        removed: row.get("removed")?,
        updated_at: parse_ts(&updated_at),
    })
}

fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let last_activity_at: String = row.get("last_activity_at")?;
    let source_path: String = row.get("source_path")?;
    let cursor_offset: i64 = row.get("cursor_offset")?;
    let last_message_kind: Option<String> = row.get("last_message_kind")?;

    Ok(Session {
        id: row.get("id")?,
        cwd: row.get("cwd")?,
        status: status
            .parse()
            .map_err(|e: String| conversion_error("status", e))?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        last_activity_at: parse_ts(&last_activity_at),
        source_path: PathBuf::from(source_path),
        cursor_offset: cursor_offset.max(0) as u64,
        last_event_id: row.get("last_event_id")?,
        last_message_kind: last_message_kind.and_then(|k| k.parse().ok()),
        last_was_error: row.get("last_was_error")?,
    })
}

fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    let kind: String = row.get("kind")?;
    let tool_input: Option<String> = row.get("tool_input")?;
    let seq_offset: i64 = row.get("seq_offset")?;
    let ts: String = row.get("ts")?;
    let source_path: String = row.get("source_path")?;

    Ok(Message {
        event_id: row.get("event_id")?,
        session_id: row.get("session_id")?,
        kind: kind.parse().map_err(|e: String| conversion_error("kind", e))?,
        text: row.get("text")?,
        tool_name: row.get("tool_name")?,
        tool_input: tool_input.and_then(|s| serde_json::from_str(&s).ok()),
        tool_use_id: row.get("tool_use_id")?,
        is_error: row.get("is_error")?,
        correlates_to: row.get("correlates_to")?,
        seq: SeqPos {
            generation: row.get("seq_generation")?,
            offset: seq_offset.max(0) as u64,
            index: row.get("seq_index")?,
        },
        timestamp: parse_ts(&ts),
        source_path: PathBuf::from(source_path),
    })
}

fn row_to_notification_record(row: &Row) -> rusqlite::Result<NotificationRecord> {
    let state: String = row.get("state")?;
    let kind: String = row.get("kind")?;
    let emitted_at: String = row.get("emitted_at")?;
    let updated_at: String = row.get("updated_at")?;
    let payload: String = row.get("payload")?;

    Ok(NotificationRecord {
        event_key: row.get("event_key")?,
        channel: row.get("channel")?,
        state: state
            .parse()
            .map_err(|e: String| conversion_error("state", e))?,
        kind: kind.parse().map_err(|e: String| conversion_error("kind", e))?,
        attempts: row.get("attempts")?,
        emitted_at: parse_ts(&emitted_at),
        updated_at: parse_ts(&updated_at),
        last_error: row.get("last_error")?,
        notification: serde_json::from_str(&payload)
            .map_err(|e| conversion_error("payload", e.to_string()))?,
    })
}
