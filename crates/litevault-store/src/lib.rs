//! SQLite access layer for litevault.
//!
//! This crate is deliberately runtime-free: everything here is blocking and
//! synchronous, and the server crate decides where that work runs. It
//! provides:
//!
//! - [`TransactionalStore`]: one connection, exclusive-transaction writes,
//!   bounded busy-retry, integrity check, and online hot backup
//! - [`StagingQueue`]: durable FIFO for writes deferred during a backup
//! - [`ChunkedFileReader`]: fixed-size chunked file streaming with progress
//! - [`retry`]: the shared bounded-retry combinator

pub mod chunk;
pub mod error;
pub mod retry;
pub mod staging;
pub mod store;

pub use chunk::{CHUNK_SIZE, ChunkedFileReader};
pub use error::StoreError;
pub use retry::RetryPolicy;
pub use staging::StagingQueue;
pub use store::{ResultSet, TransactionalStore};
