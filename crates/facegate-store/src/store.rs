//! SQLite-backed registry of identities and the append-only access log.
//!
//! Every operation opens its own connection and runs in its own
//! transaction; nothing is held open between calls.

use crate::records::{AccessEvent, Identity, RecognitionEntry, Statistics};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// How many events `get_statistics` returns in `recent_events`.
pub const RECENT_EVENTS_LIMIT: usize = 5;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    name           TEXT NOT NULL UNIQUE CHECK (length(trim(name)) > 0),
    email          TEXT,
    photo_path     TEXT NOT NULL,
    registered_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS access_events (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id    INTEGER REFERENCES identities(id),
    identity_name  TEXT NOT NULL,
    timestamp      TEXT NOT NULL,
    granted        INTEGER NOT NULL,
    confidence     REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0)
);

CREATE TRIGGER IF NOT EXISTS access_events_no_update
BEFORE UPDATE ON access_events
BEGIN
    SELECT RAISE(ABORT, 'access events are append-only');
END;

CREATE TRIGGER IF NOT EXISTS access_events_no_delete
BEFORE DELETE ON access_events
BEGIN
    SELECT RAISE(ABORT, 'access events are append-only');
END;
";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("identity '{0}' is already registered")]
    DuplicateIdentity(String),

    #[error("identity name must not be empty")]
    EmptyName,

    #[error("failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("invalid timestamp in database: {0}")]
    InvalidTimestamp(String),

    #[error("storage unavailable: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Handle to the registry database file.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(StoreError::CreateDir)?;
            }
        }

        let store = Self { path };
        let conn = store.connect()?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        tracing::debug!(path = %store.path.display(), "registry store ready");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    pub fn find_identity_by_name(&self, name: &str) -> Result<Option<Identity>, StoreError> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT id, name, email, photo_path, registered_at
                 FROM identities WHERE name = ?1",
                params![name],
                identity_from_row,
            )
            .optional()?;
        row.map(RawIdentity::into_identity).transpose()
    }

    /// Candidate set for the comparison scan, in registration order.
    pub fn list_identities_for_recognition(&self) -> Result<Vec<RecognitionEntry>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT id, name, photo_path FROM identities ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(RecognitionEntry {
                id: row.get(0)?,
                name: row.get(1)?,
                reference_photo_path: PathBuf::from(row.get::<_, String>(2)?),
            })
        })?;
        let entries = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// All identities with their details, ordered by name.
    pub fn list_identities_detailed(&self) -> Result<Vec<Identity>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, email, photo_path, registered_at
             FROM identities ORDER BY name",
        )?;
        let rows = stmt.query_map([], identity_from_row)?;
        let identities = rows
            .map(|raw| raw?.into_identity())
            .collect::<Result<Vec<_>, StoreError>>()?;
        Ok(identities)
    }

    /// Insert a new identity and return its id.
    ///
    /// Names are unique; a clash surfaces as [`StoreError::DuplicateIdentity`]
    /// and leaves the table untouched.
    pub fn add_identity(
        &self,
        name: &str,
        email: Option<&str>,
        reference_photo_path: &Path,
    ) -> Result<i64, StoreError> {
        if name.trim().is_empty() {
            return Err(StoreError::EmptyName);
        }

        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT INTO identities (name, email, photo_path, registered_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                name,
                email,
                reference_photo_path.to_string_lossy(),
                format_timestamp(Utc::now())
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation
                    && err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                return Err(StoreError::DuplicateIdentity(name.to_string()));
            }
            Err(err) => return Err(err.into()),
        }
        let id = tx.last_insert_rowid();
        tx.commit()?;

        tracing::info!(id, name, "identity added");
        Ok(id)
    }

    /// Append one decision to the access log and return its id.
    pub fn record_access_event(
        &self,
        identity_id: Option<i64>,
        name_snapshot: &str,
        granted: bool,
        confidence: f64,
    ) -> Result<i64, StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO access_events (identity_id, identity_name, timestamp, granted, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                identity_id,
                name_snapshot,
                format_timestamp(Utc::now()),
                granted,
                confidence.clamp(0.0, 1.0)
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        tracing::debug!(id, ?identity_id, name = name_snapshot, granted, confidence, "access event recorded");
        Ok(id)
    }

    pub fn get_statistics(&self) -> Result<Statistics, StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;

        let total_identities: i64 =
            tx.query_row("SELECT COUNT(*) FROM identities", [], |r| r.get(0))?;
        let (total_events, granted_count): (i64, i64) = tx.query_row(
            "SELECT COUNT(*), COALESCE(SUM(granted), 0) FROM access_events",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let (today_total, granted_today): (i64, i64) = tx.query_row(
            "SELECT COUNT(*), COALESCE(SUM(granted), 0) FROM access_events
             WHERE substr(timestamp, 1, 10) = ?1",
            params![today],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;

        let mut stmt = tx.prepare(
            "SELECT id, identity_id, identity_name, timestamp, granted, confidence
             FROM access_events ORDER BY id DESC LIMIT ?1",
        )?;
        let recent_events = stmt
            .query_map(params![RECENT_EVENTS_LIMIT as i64], event_from_row)?
            .map(|raw| raw?.into_event())
            .collect::<Result<Vec<_>, StoreError>>()?;
        drop(stmt);
        tx.commit()?;

        Ok(Statistics {
            total_identities: count(total_identities),
            total_events: count(total_events),
            granted_count: count(granted_count),
            denied_count: count(total_events - granted_count),
            granted_today: count(granted_today),
            denied_today: count(today_total - granted_today),
            recent_events,
        })
    }
}

fn count(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidTimestamp(raw.to_string()))
}

/// Row shape before timestamp parsing, which can fail outside rusqlite.
struct RawIdentity {
    id: i64,
    name: String,
    email: Option<String>,
    photo_path: String,
    registered_at: String,
}

impl RawIdentity {
    fn into_identity(self) -> Result<Identity, StoreError> {
        Ok(Identity {
            id: self.id,
            name: self.name,
            email: self.email,
            reference_photo_path: PathBuf::from(self.photo_path),
            registered_at: parse_timestamp(&self.registered_at)?,
        })
    }
}

fn identity_from_row(row: &Row<'_>) -> rusqlite::Result<RawIdentity> {
    Ok(RawIdentity {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        photo_path: row.get(3)?,
        registered_at: row.get(4)?,
    })
}

struct RawEvent {
    id: i64,
    identity_id: Option<i64>,
    identity_name: String,
    timestamp: String,
    granted: bool,
    confidence: f64,
}

impl RawEvent {
    fn into_event(self) -> Result<AccessEvent, StoreError> {
        Ok(AccessEvent {
            id: self.id,
            identity_id: self.identity_id,
            identity_name: self.identity_name,
            timestamp: parse_timestamp(&self.timestamp)?,
            granted: self.granted,
            confidence: self.confidence,
        })
    }
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok(RawEvent {
        id: row.get(0)?,
        identity_id: row.get(1)?,
        identity_name: row.get(2)?,
        timestamp: row.get(3)?,
        granted: row.get(4)?,
        confidence: row.get(5)?,
    })
}
