//! TCP listener, startup self-check, and shared server state.

use std::fs::OpenOptions;
use std::sync::Arc;

use tokio::net::TcpListener;

use litevault_store::{StagingQueue, TransactionalStore};

use crate::config::ServerConfig;
use crate::coordinator::BackupRestoreCoordinator;
use crate::error::PreflightError;
use crate::registry::SessionRegistry;
use crate::session;

/// Everything a session needs, shared across all of them.
#[derive(Debug)]
pub struct ServerState {
    pub config: ServerConfig,
    pub registry: SessionRegistry,
    pub coordinator: Arc<BackupRestoreCoordinator>,
}

#[derive(Debug)]
pub struct Server {
    state: Arc<ServerState>,
}

impl Server {
    /// Run the startup self-check and assemble the shared state. Fails before
    /// the listener binds: a server that cannot serve its database refuses to
    /// accept connections at all.
    pub fn preflight(config: ServerConfig) -> Result<Self, PreflightError> {
        let mut main = TransactionalStore::new(&config.db_path, config.retry.clone());
        main.open().map_err(|source| PreflightError::MainDatabase {
            path: config.db_path.clone(),
            source,
        })?;
        if !main.integrity_check() {
            tracing::warn!(db = %config.db_path.display(), "main db failed its integrity check at startup");
        }
        main.close();

        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&config.backup_path)
            .map_err(|source| PreflightError::BackupPath {
                path: config.backup_path.clone(),
                source,
            })?;

        let staging = StagingQueue::open(&config.staging_path)
            .map_err(|source| PreflightError::Staging { source })?;
        let pending = staging.len().unwrap_or(0);
        if pending > 0 {
            tracing::info!(pending, "staging store has writes left from a previous run");
        }

        let coordinator = Arc::new(BackupRestoreCoordinator::new(
            staging,
            config.retry.clone(),
            config.sync_pause,
        ));

        tracing::info!(
            db = %config.db_path.display(),
            backup = %config.backup_path.display(),
            "startup self-check passed"
        );

        Ok(Self {
            state: Arc::new(ServerState {
                config,
                registry: SessionRegistry::new(),
                coordinator,
            }),
        })
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Bind the configured address and accept until ctrl-c.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.state.config.listen_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener. Each connection gets
    /// its own session task; a session failing never takes the listener down.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, "listening");

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "client connected");
                            let state = Arc::clone(&self.state);
                            tokio::spawn(session::run(state, stream));
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                        }
                    }
                }
                _ = &mut ctrl_c => {
                    tracing::info!("shutdown signal received");
                    break;
                }
            }
        }

        let remaining = self.state.registry.len();
        if remaining > 0 {
            tracing::info!(remaining, "closing with sessions still connected");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config_in(dir: &std::path::Path) -> ServerConfig {
        ServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            db_path: dir.join("main.db"),
            backup_path: dir.join("main.bak.db"),
            restore_path: dir.join("restore.db"),
            staging_path: dir.join("staging.db"),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn preflight_creates_the_working_files() {
        let dir = tempdir().unwrap();
        let server = Server::preflight(config_in(dir.path())).unwrap();

        assert!(dir.path().join("main.db").exists());
        assert!(dir.path().join("main.bak.db").exists());
        assert!(dir.path().join("staging.db").exists());
        assert!(server.state().registry.is_empty());
    }

    #[test]
    fn preflight_fails_when_the_backup_path_is_a_directory() {
        let dir = tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.backup_path = dir.path().to_path_buf();

        let err = Server::preflight(config).unwrap_err();
        assert!(matches!(err, PreflightError::BackupPath { .. }));
    }
}
