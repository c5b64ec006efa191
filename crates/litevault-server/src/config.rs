//! Runtime configuration consumed by the server core.
//!
//! How these values are produced (flags, files, environment) is the calling
//! binary's concern; the core only reads this struct.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use litevault_store::RetryPolicy;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the TCP listener binds to.
    pub listen_addr: SocketAddr,
    /// Worker threads for the runtime; 0 means "number of cores".
    pub worker_threads: usize,

    /// Main database file.
    pub db_path: PathBuf,
    /// Destination file for online backups.
    pub backup_path: PathBuf,
    /// Candidate file consumed by `restore_db`.
    pub restore_path: PathBuf,
    /// SQLite file holding writes staged during a backup.
    pub staging_path: PathBuf,

    /// Page size applied via session pragmas.
    pub page_size: u32,
    /// Busy-retry budget shared by every store this server opens.
    pub retry: RetryPolicy,

    /// A session with no completed read for this long is stopped.
    pub idle_timeout: Duration,
    /// Delay after a completed backup before its state resets to idle.
    pub backup_cooldown: Duration,
    /// Best-effort drain window between stopping other sessions and
    /// rewriting the main file during restore.
    pub restore_grace: Duration,
    /// Pause between staged-write replay iterations.
    pub sync_pause: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:12321".parse().expect("static addr"),
            worker_threads: 0,
            db_path: PathBuf::from("main.db"),
            backup_path: PathBuf::from("main.bak.db"),
            restore_path: PathBuf::from("restore.db"),
            staging_path: PathBuf::from("staging.db"),
            page_size: 4096,
            retry: RetryPolicy::default(),
            idle_timeout: Duration::from_secs(60),
            backup_cooldown: Duration::from_secs(30),
            restore_grace: Duration::from_secs(5),
            sync_pause: Duration::from_millis(200),
        }
    }
}
