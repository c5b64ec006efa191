//! Multi-client TCP front end for an embedded SQLite database.
//!
//! Clients speak a line-oriented, sentinel-terminated command protocol:
//! session commands (`login`, `ping`, `who`), opaque SQL pass-through, online
//! backup with progress reporting and chunked download, and restore by file
//! copy. Writes issued while a backup runs are parked in a staging store and
//! replayed afterwards.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use config::ServerConfig;
pub use coordinator::BackupRestoreCoordinator;
pub use error::{PreflightError, SessionError};
pub use registry::{SessionHandle, SessionId, SessionRegistry};
pub use server::{Server, ServerState};
