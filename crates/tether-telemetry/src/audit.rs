//! SQLite audit log for presence events and dead letters.
//!
//! Rows mirror what the sinks receive; the query helpers exist for operators
//! and tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tether_core::{DeadLetter, DeadLetterSink, PresenceEvent, PresenceSink, SinkError};

/// Failure opening the audit database.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The directory holding the database could not be created.
    #[error("failed to create audit directory {}: {source}", path.display())]
    CreateDir {
        /// Directory that was being created.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// SQLite rejected the open or the schema.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// A presence row as stored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditPresence {
    /// Row id, increasing with insertion order.
    pub id: i64,
    /// Identity the event belongs to.
    pub uid: String,
    /// Session the event belongs to.
    pub session_id: String,
    /// `connected` or `disconnected`.
    pub kind: String,
    /// Human-readable body, e.g. `Disconnected: idle_timeout`.
    pub body: String,
    /// RFC 3339 timestamp.
    pub created_at: String,
    /// `YYYY-MM-DD` of `created_at`, for per-day queries.
    pub created_date: String,
    /// Unix time in microseconds.
    pub microtime: i64,
}

/// A dead-letter row as stored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditDeadLetter {
    /// Row id, increasing with insertion order.
    pub id: i64,
    /// Id of the undelivered message.
    pub message_id: Option<String>,
    /// Recipient identity.
    pub target: String,
    /// Message action.
    pub action: String,
    /// Message body as JSON text.
    pub body: String,
    /// Writes performed before giving up.
    pub attempts: u32,
    /// RFC 3339 time tracking began.
    pub first_enqueued_at: String,
    /// RFC 3339 time the message was dead-lettered.
    pub dead_lettered_at: String,
}

/// SQLite store for presence events and dead letters.
///
/// Inserts from the async sink traits run on the blocking pool so a slow
/// disk never stalls a connection task.
#[derive(Clone)]
pub struct SqliteAuditLog {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAuditLog {
    /// Open (or create) the audit database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| AuditError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(Self::with_connection(conn)?)
    }

    /// Private in-memory database.
    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS presence (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 uid TEXT NOT NULL,
                 session_id TEXT NOT NULL,
                 kind TEXT NOT NULL,
                 body TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 created_date TEXT NOT NULL,
                 microtime INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_presence_uid ON presence(uid);
             CREATE INDEX IF NOT EXISTS idx_presence_date ON presence(created_date);
             CREATE TABLE IF NOT EXISTS dead_letters (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 message_id TEXT,
                 target TEXT NOT NULL,
                 action TEXT NOT NULL,
                 body TEXT NOT NULL,
                 attempts INTEGER NOT NULL,
                 first_enqueued_at TEXT NOT NULL,
                 dead_lettered_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_dead_letters_target ON dead_letters(target);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert one presence event.
    pub fn insert_presence(&self, event: &PresenceEvent) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO presence (uid, session_id, kind, body, created_at, created_date, microtime)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                event.identity.as_str(),
                event.session_id.as_str(),
                event.kind.as_str(),
                event.body,
                event.timestamp.to_rfc3339(),
                event.timestamp.format("%Y-%m-%d").to_string(),
                event.timestamp.timestamp_micros(),
            ],
        )?;
        Ok(())
    }

    /// Insert one dead letter.
    pub fn insert_dead_letter(&self, letter: &DeadLetter) -> Result<(), rusqlite::Error> {
        let body = serde_json::to_string(&letter.message.body).unwrap_or_default();
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO dead_letters (message_id, target, action, body, attempts, first_enqueued_at, dead_lettered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                letter.message.message_id.as_ref().map(|id| id.as_str().to_string()),
                letter.target_identity.as_str(),
                letter.message.action,
                body,
                letter.attempts,
                letter.first_enqueued_at.to_rfc3339(),
                letter.dead_lettered_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Most recent presence rows, newest first.
    pub fn recent_presence(&self, limit: u32) -> Result<Vec<AuditPresence>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, uid, session_id, kind, body, created_at, created_date, microtime
             FROM presence ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], |row| {
            Ok(AuditPresence {
                id: row.get(0)?,
                uid: row.get(1)?,
                session_id: row.get(2)?,
                kind: row.get(3)?,
                body: row.get(4)?,
                created_at: row.get(5)?,
                created_date: row.get(6)?,
                microtime: row.get(7)?,
            })
        })?;
        rows.collect()
    }

    /// Most recent dead letters, newest first.
    pub fn dead_letters(&self, limit: u32) -> Result<Vec<AuditDeadLetter>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, message_id, target, action, body, attempts, first_enqueued_at, dead_lettered_at
             FROM dead_letters ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], |row| {
            Ok(AuditDeadLetter {
                id: row.get(0)?,
                message_id: row.get(1)?,
                target: row.get(2)?,
                action: row.get(3)?,
                body: row.get(4)?,
                attempts: row.get(5)?,
                first_enqueued_at: row.get(6)?,
                dead_lettered_at: row.get(7)?,
            })
        })?;
        rows.collect()
    }

    /// Number of stored presence rows.
    pub fn presence_count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM presence", [], |row| row.get(0))
    }
}

fn sink_error(err: impl std::fmt::Display) -> SinkError {
    SinkError::new("audit", err.to_string())
}

#[async_trait]
impl PresenceSink for SqliteAuditLog {
    async fn record(&self, event: PresenceEvent) -> Result<(), SinkError> {
        let log = self.clone();
        tokio::task::spawn_blocking(move || log.insert_presence(&event))
            .await
            .map_err(sink_error)?
            .map_err(sink_error)
    }
}

#[async_trait]
impl DeadLetterSink for SqliteAuditLog {
    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), SinkError> {
        let log = self.clone();
        tokio::task::spawn_blocking(move || log.insert_dead_letter(&letter))
            .await
            .map_err(sink_error)?
            .map_err(sink_error)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use tether_core::{Identity, Message, MessageId, PresenceKind, SessionId};

    use super::*;

    fn presence(uid: &str, kind: PresenceKind) -> PresenceEvent {
        PresenceEvent::new(
            Identity::parse(uid).unwrap(),
            SessionId::new(),
            kind,
            match kind {
                PresenceKind::Connected => "Connected",
                PresenceKind::Disconnected => "Disconnected",
            },
        )
    }

    #[test]
    fn insert_and_query_presence() {
        let log = SqliteAuditLog::in_memory().unwrap();
        log.insert_presence(&presence("u1", PresenceKind::Connected)).unwrap();
        log.insert_presence(&presence("u1", PresenceKind::Disconnected)).unwrap();

        assert_eq!(log.presence_count().unwrap(), 2);
        let rows = log.recent_presence(10).unwrap();
        assert_eq!(rows[0].kind, "disconnected");
        assert_eq!(rows[1].kind, "connected");
        assert_eq!(rows[0].uid, "u1");
        assert_eq!(rows[0].created_date.len(), 10);
        assert!(rows[0].microtime > 0);
    }

    #[test]
    fn recent_presence_respects_limit() {
        let log = SqliteAuditLog::in_memory().unwrap();
        for _ in 0..5 {
            log.insert_presence(&presence("u2", PresenceKind::Connected)).unwrap();
        }
        assert_eq!(log.recent_presence(3).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn presence_sink_persists() {
        let log = SqliteAuditLog::in_memory().unwrap();
        let sink: Arc<dyn PresenceSink> = Arc::new(log.clone());
        sink.record(presence("u3", PresenceKind::Connected)).await.unwrap();
        assert_eq!(log.presence_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn dead_letter_sink_persists() {
        let log = SqliteAuditLog::in_memory().unwrap();
        let letter = DeadLetter {
            target_identity: Identity::parse("u4").unwrap(),
            message: Message::new("push", json!({"n": 1})).with_id(MessageId::from_raw("msg_x")),
            attempts: 5,
            first_enqueued_at: Utc::now(),
            dead_lettered_at: Utc::now(),
        };
        log.dead_letter(letter).await.unwrap();

        let rows = log.dead_letters(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message_id.as_deref(), Some("msg_x"));
        assert_eq!(rows[0].target, "u4");
        assert_eq!(rows[0].attempts, 5);
        assert_eq!(rows[0].body, r#"{"n":1}"#);
    }

    #[test]
    fn open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/audit.db");
        let log = SqliteAuditLog::open(&path).unwrap();
        log.insert_presence(&presence("u5", PresenceKind::Connected)).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn open_reports_unusable_parent() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let err = SqliteAuditLog::open(&blocker.join("audit.db")).err().unwrap();
        assert!(matches!(err, AuditError::CreateDir { ref path, .. } if *path == blocker));
        assert!(err.to_string().contains("blocker"));
    }
}
