//! SQLite connection wrapper with bounded busy-retry and online hot backup.
//!
//! One [`TransactionalStore`] wraps one `rusqlite::Connection` and is used
//! from a single logical owner at a time. Concurrent sessions each hold their
//! own store against the same database file and rely on SQLite's own locking;
//! contention surfaces as busy/locked, which every execution path retries
//! through [`crate::retry`] with the policy supplied at construction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use rusqlite::backup::{Backup, StepResult};
use rusqlite::types::ValueRef;

use crate::error::{StoreError, is_busy_sqlite};
use crate::retry::{self, RetryPolicy, WaitFn, blocking_wait};

/// Pages copied per backup step, as in the SQLite online-backup example.
const BACKUP_PAGES_PER_STEP: std::ffi::c_int = 2048;

/// Pause between backup steps while the source is live.
const BACKUP_STEP_PAUSE: Duration = Duration::from_millis(100);

/// A fully materialized query result with a cursor interface.
///
/// Rows are collected up front so the statement does not outlive the borrow
/// of the connection; values are rendered as text the way
/// `sqlite3_column_text` renders them (numbers stringified, NULL as `None`).
#[derive(Debug)]
pub struct ResultSet {
    columns: usize,
    rows: Vec<Vec<Option<String>>>,
    cursor: Option<usize>,
}

impl ResultSet {
    fn new(columns: usize, rows: Vec<Vec<Option<String>>>) -> Self {
        Self {
            columns,
            rows,
            cursor: None,
        }
    }

    /// Advance to the next row. Returns false once the set is exhausted.
    pub fn next(&mut self) -> bool {
        let next = self.cursor.map_or(0, |c| c + 1);
        if next < self.rows.len() {
            self.cursor = Some(next);
            true
        } else {
            false
        }
    }

    pub fn column_count(&self) -> usize {
        self.columns
    }

    /// Text of column `i` in the current row; `None` for SQL NULL or before
    /// the first `next()`.
    pub fn column_text(&self, i: usize) -> Option<&str> {
        let row = self.rows.get(self.cursor?)?;
        row.get(i)?.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

fn value_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Some(String::from_utf8_lossy(b).into_owned()),
    }
}

/// SQLite store with exclusive-transaction writes and busy-retry.
pub struct TransactionalStore {
    path: PathBuf,
    conn: Option<Connection>,
    policy: RetryPolicy,
    wait: Box<WaitFn<'static>>,
}

impl TransactionalStore {
    pub fn new(path: impl Into<PathBuf>, policy: RetryPolicy) -> Self {
        Self {
            path: path.into(),
            conn: None,
            policy,
            wait: Box::new(blocking_wait),
        }
    }

    pub fn with_defaults(path: impl Into<PathBuf>) -> Self {
        Self::new(path, RetryPolicy::default())
    }

    /// Replace the inter-attempt wait. Tests use this to avoid real sleeps.
    pub fn set_wait(&mut self, wait: impl Fn(Duration) + Send + Sync + 'static) {
        self.wait = Box::new(wait);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the connection. Idempotent: a second call on a connected store is
    /// a no-op.
    pub fn open(&mut self) -> Result<(), StoreError> {
        if self.conn.is_some() {
            return Ok(());
        }
        let conn = Connection::open(&self.path)?;
        self.conn = Some(conn);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Drop the connection. A later `open()` reconnects.
    pub fn close(&mut self) {
        self.conn = None;
    }

    fn conn(&self) -> Result<&Connection, StoreError> {
        self.conn.as_ref().ok_or_else(|| StoreError::NotConnected {
            path: self.path.clone(),
        })
    }

    /// Session pragmas applied once per connection (original server behavior):
    /// WAL journal, UTF-8 encoding, foreign keys, page size, cache size.
    pub fn apply_session_pragmas(&self, page_size: u32) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let pragmas = format!(
            "PRAGMA journal_mode = WAL;\n\
             PRAGMA encoding = \"UTF-8\";\n\
             PRAGMA foreign_keys = 1;\n\
             PRAGMA page_size = {page_size};\n\
             PRAGMA cache_size = -3000;"
        );
        conn.execute_batch(&pragmas)?;
        Ok(())
    }

    /// Run a read statement and materialize its rows.
    ///
    /// Prepare and step share one retry budget; a statement that stays
    /// busy/locked past the budget fails with [`StoreError::Busy`].
    pub fn execute_select(&self, sql: &str) -> Result<ResultSet, StoreError> {
        let conn = self.conn()?;
        retry::run(&self.policy, &*self.wait, is_busy_sqlite, || {
            Self::collect_rows(conn, sql)
        })
        .map_err(|source| self.classify(source))
    }

    fn collect_rows(conn: &Connection, sql: &str) -> Result<ResultSet, rusqlite::Error> {
        let mut stmt = conn.prepare(sql)?;
        let columns = stmt.column_count();
        let mut out = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns);
            for i in 0..columns {
                values.push(value_text(row.get_ref(i)?));
            }
            out.push(values);
        }
        Ok(ResultSet::new(columns, out))
    }

    /// Run a write statement inside an EXCLUSIVE transaction and return the
    /// affected-row count.
    ///
    /// `BEGIN EXCLUSIVE` is retried under the store's policy while the engine
    /// reports busy/locked, then the statement itself under the same policy.
    /// A failed statement rolls the transaction back.
    pub fn execute_write(&self, sql: &str) -> Result<i64, StoreError> {
        let conn = self.conn()?;

        retry::run(&self.policy, &*self.wait, is_busy_sqlite, || {
            conn.execute_batch("BEGIN EXCLUSIVE TRANSACTION;")
        })
        .map_err(|source| self.classify(source))?;

        let changed = retry::run(&self.policy, &*self.wait, is_busy_sqlite, || {
            conn.execute(sql, [])
        });

        match changed {
            Ok(count) => {
                retry::run(&self.policy, &*self.wait, is_busy_sqlite, || {
                    conn.execute_batch("COMMIT;")
                })
                .map_err(|source| self.classify(source))?;
                Ok(count as i64)
            }
            Err(source) => {
                if let Err(rollback) = conn.execute_batch("ROLLBACK;") {
                    tracing::warn!(error = %rollback, "rollback after failed write also failed");
                }
                if is_busy_sqlite(&source) {
                    Err(self.classify(source))
                } else {
                    Err(StoreError::Step { source })
                }
            }
        }
    }

    fn classify(&self, source: rusqlite::Error) -> StoreError {
        if is_busy_sqlite(&source) {
            StoreError::Busy {
                attempts: self.policy.max_attempts,
                source,
            }
        } else {
            StoreError::Prepare { source }
        }
    }

    /// Engine-wide consistency scan. True iff the check reports `ok`; any
    /// failure to run the scan counts as a failed check, never a panic.
    pub fn integrity_check(&self) -> bool {
        let mut result = match self.execute_select("PRAGMA integrity_check;") {
            Ok(set) => set,
            Err(err) => {
                tracing::warn!(error = %err, path = %self.path.display(), "integrity check could not run");
                return false;
            }
        };

        let mut report = String::new();
        while result.next() {
            if let Some(line) = result.column_text(0) {
                report.push_str(line);
                report.push('\n');
            }
        }

        tracing::debug!(path = %self.path.display(), report = %report.trim_end(), "integrity check");
        report.starts_with("ok")
    }

    /// Online hot backup of this database into `dest`, page batch by page
    /// batch, without taking the source offline.
    ///
    /// `on_progress(remaining, total)` runs after every step. `total` can be
    /// reported as 0 by the engine mid-operation; callers guard the divide.
    pub fn backup(
        &self,
        dest: &Path,
        mut on_progress: impl FnMut(i32, i32),
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let mut dst = Connection::open(dest).map_err(|source| StoreError::Backup {
            dest: dest.to_path_buf(),
            source,
        })?;

        let backup = Backup::new(conn, &mut dst).map_err(|source| StoreError::Backup {
            dest: dest.to_path_buf(),
            source,
        })?;

        loop {
            let step = backup
                .step(BACKUP_PAGES_PER_STEP)
                .map_err(|source| StoreError::Backup {
                    dest: dest.to_path_buf(),
                    source,
                })?;

            let progress = backup.progress();
            on_progress(progress.remaining, progress.pagecount);

            match step {
                StepResult::Done => break,
                // Busy/Locked are transient here: writers on the source hold
                // the lock, the copy resumes on the next step. StepResult is
                // non-exhaustive; unknown results get the same pause.
                StepResult::More | StepResult::Busy | StepResult::Locked => {
                    (self.wait)(BACKUP_STEP_PAUSE);
                }
                _ => (self.wait)(BACKUP_STEP_PAUSE),
            }
        }

        Ok(())
    }
}
