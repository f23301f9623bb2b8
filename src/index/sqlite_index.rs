//! SQLite-backed metadata index

use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::{BlacklistEntry, MetadataIndex, StoredObject};
use crate::error::RelayError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS stored_objects (
    handle       TEXT PRIMARY KEY NOT NULL,
    content_hash TEXT NOT NULL,
    origin       TEXT NOT NULL,
    size_bytes   INTEGER NOT NULL,
    uploaded_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_stored_objects_uploaded_at ON stored_objects(uploaded_at);

CREATE TABLE IF NOT EXISTS blacklist (
    content_hash TEXT PRIMARY KEY NOT NULL,
    banned_at    INTEGER NOT NULL
);
";

/// Metadata index backed by a single SQLite connection
pub struct SqliteIndex {
    conn: Mutex<Connection>,
}

impl SqliteIndex {
    /// Open or create the index database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RelayError> {
        let conn = Connection::open(path.as_ref())?;

        // WAL keeps sweeper reads from blocking upload inserts
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let index = Self::from_conn(conn)?;
        info!(path = %path.as_ref().display(), "Opened SQLite metadata index");
        Ok(index)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, RelayError> {
        debug!("Opening in-memory SQLite index");
        Self::from_conn(Connection::open_in_memory()?)
    }

    fn from_conn(conn: Connection) -> Result<Self, RelayError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, RelayError> {
        self.conn
            .lock()
            .map_err(|e| RelayError::Internal(format!("Lock poisoned: {}", e)))
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn object_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredObject> {
    Ok(StoredObject {
        handle: row.get(0)?,
        content_hash: row.get(1)?,
        origin: row.get(2)?,
        size_bytes: row.get::<_, i64>(3)?.max(0) as u64,
        uploaded_at: from_millis(row.get(4)?),
    })
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl MetadataIndex for SqliteIndex {
    fn insert(&self, object: &StoredObject) -> Result<(), RelayError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO stored_objects (handle, content_hash, origin, size_bytes, uploaded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                object.handle,
                object.content_hash,
                object.origin,
                object.size_bytes as i64,
                object.uploaded_at.timestamp_millis(),
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                RelayError::AlreadyExists(object.handle.clone())
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    fn get(&self, handle: &str) -> Result<Option<StoredObject>, RelayError> {
        let conn = self.conn()?;
        let object = conn
            .query_row(
                "SELECT handle, content_hash, origin, size_bytes, uploaded_at
                 FROM stored_objects WHERE handle = ?1",
                params![handle],
                object_from_row,
            )
            .optional()?;
        Ok(object)
    }

    fn find_blacklisted(&self, content_hash: &str) -> Result<Option<BlacklistEntry>, RelayError> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                "SELECT content_hash, banned_at FROM blacklist WHERE content_hash = ?1",
                params![content_hash],
                |row| {
                    Ok(BlacklistEntry {
                        content_hash: row.get(0)?,
                        banned_at: from_millis(row.get(1)?),
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    fn find_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<StoredObject>, RelayError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT handle, content_hash, origin, size_bytes, uploaded_at
             FROM stored_objects WHERE uploaded_at < ?1
             ORDER BY uploaded_at ASC, handle ASC",
        )?;
        let expired = stmt
            .query_map(params![cutoff.timestamp_millis()], object_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(expired)
    }

    fn delete_many(&self, handles: &[String]) -> Result<usize, RelayError> {
        if handles.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut removed = 0usize;
        {
            let mut stmt = tx.prepare("DELETE FROM stored_objects WHERE handle = ?1")?;
            for handle in handles {
                removed += stmt.execute(params![handle])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    fn delete_expired(&self, snapshot: &[StoredObject]) -> Result<usize, RelayError> {
        if snapshot.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut removed = 0usize;
        {
            let mut stmt =
                tx.prepare("DELETE FROM stored_objects WHERE handle = ?1 AND uploaded_at = ?2")?;
            for expired in snapshot {
                removed += stmt.execute(params![
                    expired.handle,
                    expired.uploaded_at.timestamp_millis()
                ])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    fn ban(&self, content_hash: &str, at: DateTime<Utc>) -> Result<BlacklistEntry, RelayError> {
        {
            let conn = self.conn()?;
            conn.execute(
                "INSERT OR IGNORE INTO blacklist (content_hash, banned_at) VALUES (?1, ?2)",
                params![content_hash, at.trunc_subsecs(3).timestamp_millis()],
            )?;
        }
        self.find_blacklisted(content_hash)?
            .ok_or_else(|| RelayError::Internal("ban was not recorded".into()))
    }

    fn unban(&self, content_hash: &str) -> Result<bool, RelayError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM blacklist WHERE content_hash = ?1",
            params![content_hash],
        )?;
        Ok(removed > 0)
    }

    fn count(&self) -> Result<u64, RelayError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM stored_objects", [], |row| {
            row.get(0)
        })?;
        Ok(count.max(0) as u64)
    }
}
