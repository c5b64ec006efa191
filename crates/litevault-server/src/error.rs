//! Server-side error types.
//!
//! The split mirrors the failure taxonomy: [`SessionError`] is caught at the
//! command-dispatch boundary and turned into an `ERROR: ...` reply without
//! ending the session; transport faults stay `std::io::Error` and do end it;
//! [`PreflightError`] is fatal at startup, before the listener binds.

use std::path::PathBuf;

use litevault_store::StoreError;

/// Business-logic failure surfaced to the client as a reply line.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{message}")]
    Logic { message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    pub fn logic(message: impl Into<String>) -> Self {
        SessionError::Logic {
            message: message.into(),
        }
    }
}

/// Fatal startup failures. The process exits on any of these rather than
/// accept connections it cannot serve.
#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    #[error("can't open main database '{}': {source}", path.display())]
    MainDatabase {
        path: PathBuf,
        #[source]
        source: StoreError,
    },

    #[error("backup path '{}' is not writable: {source}", path.display())]
    BackupPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("staging store can't be opened or created: {source}")]
    Staging {
        #[source]
        source: StoreError,
    },
}
