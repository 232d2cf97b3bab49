//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use crate::error::{Error, Result};
use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: sessions, messages, cursors
    r#"
    -- ============================================
    -- Ingestion state (owned by the session store)
    -- ============================================

    CREATE TABLE IF NOT EXISTS source_files (
        path             TEXT PRIMARY KEY,
        session_id       TEXT,
        byte_offset      INTEGER NOT NULL DEFAULT 0 CHECK (byte_offset >= 0),
        device           INTEGER NOT NULL DEFAULT 0,
        inode            INTEGER NOT NULL DEFAULT 0,
        fingerprint      TEXT,
        fingerprint_len  INTEGER NOT NULL DEFAULT 0,
        generation       INTEGER NOT NULL DEFAULT 0,
        removed          INTEGER NOT NULL DEFAULT 0,
        updated_at       DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sessions (
        id                TEXT PRIMARY KEY,
        cwd               TEXT,
        status            TEXT NOT NULL,
        created_at        DATETIME NOT NULL,
        updated_at        DATETIME NOT NULL,
        last_activity_at  DATETIME NOT NULL,
        source_path       TEXT NOT NULL,
        cursor_offset     INTEGER NOT NULL DEFAULT 0,
        last_event_id     TEXT,
        last_message_kind TEXT,
        last_was_error    INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
    CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at);

    CREATE TABLE IF NOT EXISTS messages (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id         TEXT NOT NULL UNIQUE,
        session_id       TEXT NOT NULL REFERENCES sessions(id),
        kind             TEXT NOT NULL,
        text             TEXT,
        tool_name        TEXT,
        tool_input       JSON,
        tool_use_id      TEXT,
        is_error         INTEGER NOT NULL DEFAULT 0,
        correlates_to    TEXT,
        seq_generation   INTEGER NOT NULL,
        seq_offset       INTEGER NOT NULL,
        seq_index        INTEGER NOT NULL,
        ts               DATETIME NOT NULL,
        source_path      TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_messages_session_seq
        ON messages(session_id, seq_generation, seq_offset, seq_index);
    CREATE INDEX IF NOT EXISTS idx_messages_correlates ON messages(correlates_to);
    "#,
    // Version 2: notification ledger
    r#"
    -- ============================================
    -- Delivery ledger (owned by the broadcaster)
    -- ============================================

    CREATE TABLE IF NOT EXISTS notification_records (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        event_key        TEXT NOT NULL,
        channel          TEXT NOT NULL,
        state            TEXT NOT NULL,
        kind             TEXT NOT NULL,
        attempts         INTEGER NOT NULL DEFAULT 0,
        emitted_at       DATETIME NOT NULL,
        updated_at       DATETIME NOT NULL,
        last_error       TEXT,
        payload          JSON NOT NULL,

        UNIQUE(event_key, channel)
    );

    CREATE INDEX IF NOT EXISTS idx_notification_records_state
        ON notification_records(channel, state);
    "#,
];

/// Run all pending migrations
///
/// A database written by a newer schema is refused rather than guessed at.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(Error::Config(format!(
            "database schema version {} is newer than supported version {}",
            current_version, SCHEMA_VERSION
        )));
    }

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        // Run migrations twice - should be idempotent
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables = [
            "source_files",
            "sessions",
            "messages",
            "notification_records",
        ];

        for table in tables {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION + 1), [])
            .unwrap();

        let err = run_migrations(&conn).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_event_id_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO sessions (id, status, created_at, updated_at, last_activity_at, source_path)
             VALUES ('s', 'active', 'now', 'now', 'now', '/x.jsonl')",
            [],
        )
        .unwrap();
        let insert = "INSERT INTO messages (event_id, session_id, kind, seq_generation, seq_offset,
                                            seq_index, ts, source_path)
                      VALUES ('e1', 's', 'user', 0, 0, 0, 'now', '/x.jsonl')";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }
}
