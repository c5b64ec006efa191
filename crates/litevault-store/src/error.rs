//! Error types for the SQLite access layer.

use std::path::PathBuf;

/// Errors produced by [`crate::TransactionalStore`] and the staging queue.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Operation attempted before `open()` succeeded.
    #[error("no database connection (path: {})", path.display())]
    NotConnected { path: PathBuf },

    /// The engine kept reporting busy/locked until the retry budget ran out.
    #[error("database busy after {attempts} attempts: {source}")]
    Busy {
        attempts: usize,
        #[source]
        source: rusqlite::Error,
    },

    /// Statement failed to prepare.
    #[error("prepare failed for statement: {source}")]
    Prepare {
        #[source]
        source: rusqlite::Error,
    },

    /// Stepping a prepared statement failed with a non-retryable code.
    #[error("step failed: {source}")]
    Step {
        #[source]
        source: rusqlite::Error,
    },

    /// Online backup failed partway through.
    #[error("backup to {} failed: {source}", dest.display())]
    Backup {
        dest: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Any other engine-level failure.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True when the underlying SQLite code is busy or locked, i.e. another
    /// writer currently holds the lock and the caller may retry.
    pub fn is_busy(&self) -> bool {
        match self {
            StoreError::Busy { .. } => true,
            StoreError::Prepare { source }
            | StoreError::Step { source }
            | StoreError::Sqlite(source) => is_busy_sqlite(source),
            _ => false,
        }
    }
}

/// Busy/locked check on a raw rusqlite error.
pub(crate) fn is_busy_sqlite(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}
