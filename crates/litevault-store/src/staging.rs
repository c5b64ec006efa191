//! Durable FIFO of writes deferred during a backup.
//!
//! While a hot backup is in flight the main database cannot take new
//! writers, so write statements are parked in a dedicated SQLite file and
//! replayed in insertion order once the backup completes. Rows are only ever
//! inserted and deleted; rowid order is the replay order.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, OpenFlags, params};

use crate::error::StoreError;

const CREATE_TABLE: &str = "CREATE TABLE staged_writes (
    sql_text    TEXT NOT NULL,
    inserted_at DATETIME DEFAULT CURRENT_TIMESTAMP
);";

/// On-disk staging queue backed by its own SQLite file.
pub struct StagingQueue {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl StagingQueue {
    /// Open the staging store, creating the file and table when missing.
    /// An existing file is reused as-is so writes staged before a crash are
    /// replayed after restart.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let existing = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        );

        let conn = match existing {
            Ok(conn) => conn,
            Err(err) => {
                tracing::info!(
                    path = %path.display(),
                    error = %err,
                    "staging store missing, creating a new one"
                );
                let conn = Connection::open_with_flags(
                    &path,
                    OpenFlags::SQLITE_OPEN_READ_WRITE
                        | OpenFlags::SQLITE_OPEN_CREATE
                        | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
                )?;
                conn.execute_batch(CREATE_TABLE)?;
                conn
            }
        };

        // A reused file may predate the table (empty file left by a crash).
        let have_table: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'staged_writes'",
            [],
            |row| row.get(0),
        )?;
        if have_table == 0 {
            conn.execute_batch(CREATE_TABLE)?;
        }

        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a write statement; returns the assigned rowid.
    pub fn push(&self, sql: &str) -> Result<i64, StoreError> {
        let conn = self.conn.lock().expect("staging queue mutex poisoned");
        conn.execute(
            "INSERT INTO staged_writes (sql_text) VALUES (?1)",
            params![sql],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Oldest staged statement, or `None` when the queue is empty.
    pub fn front(&self) -> Result<Option<(i64, String)>, StoreError> {
        let conn = self.conn.lock().expect("staging queue mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT rowid, sql_text FROM staged_writes ORDER BY rowid ASC LIMIT 1",
        )?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some((row.get(0)?, row.get(1)?))),
            None => Ok(None),
        }
    }

    /// Delete a replayed row.
    pub fn remove(&self, rowid: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("staging queue mutex poisoned");
        conn.execute("DELETE FROM staged_writes WHERE rowid = ?1", params![rowid])?;
        Ok(())
    }

    pub fn len(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().expect("staging queue mutex poisoned");
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM staged_writes", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}
