use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use litevault_server::{Server, ServerConfig};
use litevault_store::RetryPolicy;

#[derive(Parser, Debug)]
#[command(name = "litevault", version)]
#[command(about = "Multi-client TCP server over an embedded SQLite database")]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:12321")]
    listen: SocketAddr,

    /// Worker threads for the runtime (0 = number of cores)
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Main database file
    #[arg(long, default_value = "main.db")]
    db: PathBuf,

    /// Destination file for online backups
    #[arg(long, default_value = "main.bak.db")]
    backup: PathBuf,

    /// Candidate file consumed by restore_db
    #[arg(long, default_value = "restore.db")]
    restore: PathBuf,

    /// Store for writes staged while a backup runs
    #[arg(long, default_value = "staging.db")]
    staging: PathBuf,

    /// SQLite page size applied per session
    #[arg(long, default_value_t = 4096)]
    page_size: u32,

    /// Busy-retry attempts per statement
    #[arg(long, default_value_t = 200)]
    busy_attempts: usize,

    /// Pause between busy retries
    #[arg(long, default_value = "50ms", value_parser = humantime::parse_duration)]
    busy_wait: Duration,

    /// Sessions with no command for this long are dropped
    #[arg(long, default_value = "1m", value_parser = humantime::parse_duration)]
    idle_timeout: Duration,

    /// Delay after a completed backup before a new one may start
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    backup_cooldown: Duration,

    /// Drain window between stopping sessions and rewriting the db on restore
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    restore_grace: Duration,

    /// Pause between staged-write replay iterations
    #[arg(long, default_value = "200ms", value_parser = humantime::parse_duration)]
    sync_pause: Duration,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            listen_addr: self.listen,
            worker_threads: self.threads,
            db_path: self.db,
            backup_path: self.backup,
            restore_path: self.restore,
            staging_path: self.staging,
            page_size: self.page_size,
            retry: RetryPolicy {
                max_attempts: self.busy_attempts,
                wait: self.busy_wait,
            },
            idle_timeout: self.idle_timeout,
            backup_cooldown: self.backup_cooldown,
            restore_grace: self.restore_grace,
            sync_pause: self.sync_pause,
        }
    }
}

fn main() -> ExitCode {
    // Initialize JSON logging once.
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let env_filter = match "info".parse() {
        Ok(directive) => env_filter.add_directive(directive),
        Err(_) => env_filter, // fallback to default if parsing fails
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .try_init();

    let config = Cli::parse().into_config();

    let server = match Server::preflight(config.clone()) {
        Ok(server) => server,
        Err(err) => {
            tracing::error!(error = %err, "startup self-check failed");
            return ExitCode::FAILURE;
        }
    };

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if config.worker_threads > 0 {
        builder.worker_threads(config.worker_threads);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = %err, "can't build the runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(server.run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "server failed");
            ExitCode::FAILURE
        }
    }
}
