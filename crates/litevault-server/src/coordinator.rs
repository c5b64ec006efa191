//! Backup/restore orchestration and write staging.
//!
//! One coordinator is shared by every session. Each state aggregate gets its
//! own narrow lock (backup progress, restore progress, cached scalar, session
//! list lives elsewhere), which keeps lock ordering trivial: no method ever
//! holds two of them at once.
//!
//! Progress encoding, both for backup and restore: -1 idle, 0..=99 in
//! progress, 100 complete (backup only; restore ends the initiating session
//! instead of persisting a complete state).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use litevault_store::{ChunkedFileReader, RetryPolicy, StagingQueue, TransactionalStore};

use crate::error::SessionError;

const PLACE_FREE_SELECT: &str = "select PlaceFree from Config;";

/// Sentinel meaning "never loaded".
const SCALAR_UNSET: &str = "-1";

/// Reconnect budget while replaying staged writes against a main store that
/// went away mid-sync.
const SYNC_RECONNECT_TRIES: u32 = 20;
const SYNC_RECONNECT_PAUSE: Duration = Duration::from_millis(500);

/// A single cached string value refreshed by a SELECT. Readers get the last
/// good value even when a refresh fails.
struct CachedScalar {
    value: RwLock<String>,
}

impl CachedScalar {
    fn new() -> Self {
        Self {
            value: RwLock::new(SCALAR_UNSET.to_string()),
        }
    }

    fn get(&self) -> String {
        self.value.read().expect("scalar lock poisoned").clone()
    }

    fn set(&self, value: String) {
        *self.value.write().expect("scalar lock poisoned") = value;
    }

    fn is_unset(&self) -> bool {
        *self.value.read().expect("scalar lock poisoned") == SCALAR_UNSET
    }
}

/// Shared orchestration state for online backup, restore, and staged writes.
pub struct BackupRestoreCoordinator {
    backup_progress: RwLock<i32>,
    restore_progress: RwLock<i32>,
    place_free: CachedScalar,
    staging: StagingQueue,
    /// Non-reentrant gate around staged-write replay; a second trigger while
    /// a pass runs is a no-op.
    sync_gate: Mutex<()>,
    cooldown_armed: AtomicBool,
    retry: RetryPolicy,
    sync_pause: Duration,
}

impl BackupRestoreCoordinator {
    pub fn new(staging: StagingQueue, retry: RetryPolicy, sync_pause: Duration) -> Self {
        Self {
            backup_progress: RwLock::new(-1),
            restore_progress: RwLock::new(-1),
            place_free: CachedScalar::new(),
            staging,
            sync_gate: Mutex::new(()),
            cooldown_armed: AtomicBool::new(false),
            retry,
            sync_pause,
        }
    }

    pub fn staging_len(&self) -> u64 {
        self.staging.len().unwrap_or(0)
    }

    // ---- backup state ----------------------------------------------------

    pub fn backup_progress(&self) -> i32 {
        *self.backup_progress.read().expect("backup lock poisoned")
    }

    pub fn reset_backup_progress(&self) {
        *self.backup_progress.write().expect("backup lock poisoned") = -1;
    }

    fn set_backup_progress(&self, value: i32) {
        *self.backup_progress.write().expect("backup lock poisoned") = value;
    }

    /// Start a hot backup, or report the one already running.
    ///
    /// At most one physical backup executes: the check-and-claim happens
    /// under the write lock, so concurrent callers past the first observe a
    /// progress value instead of starting new work. Returns Ok(100) on
    /// verified success, Ok(progress) for a backup in flight, or the failure
    /// reason (state reset to idle).
    ///
    /// Blocking; run off the event loop.
    pub fn start_or_query_backup(
        &self,
        store: &TransactionalStore,
        dest: &Path,
    ) -> Result<i32, SessionError> {
        {
            let mut progress = self.backup_progress.write().expect("backup lock poisoned");
            if *progress != -1 {
                return Ok(*progress);
            }
            *progress = 0;
        }

        let copied = store.backup(dest, |remaining, total| {
            // the engine may report a zero pagecount mid-operation
            let total = if total == 0 { 1 } else { total };
            let mut pct = 100 * (total - remaining).abs() / total;
            if pct == 100 {
                pct = 99;
            }
            self.set_backup_progress(pct);
            tracing::debug!(progress = pct, "backup in progress");
        });

        if let Err(err) = copied {
            tracing::warn!(error = %err, dest = %dest.display(), "backup failed");
            self.reset_backup_progress();
            return Err(err.into());
        }

        // verify the produced file before declaring the backup usable
        let mut check = TransactionalStore::new(dest, self.retry.clone());
        if let Err(err) = check.open() {
            tracing::warn!(error = %err, "can't open backup file for integrity check");
            self.reset_backup_progress();
            return Err(SessionError::logic(format!(
                "can't open '{}' for integrity check: {err}",
                dest.display()
            )));
        }
        if !check.integrity_check() {
            tracing::warn!(dest = %dest.display(), "backup integrity check failed");
            self.reset_backup_progress();
            return Err(SessionError::logic(format!(
                "integrity check failed for '{}'",
                dest.display()
            )));
        }

        tracing::debug!("backup integrity check OK");
        self.set_backup_progress(100);
        Ok(100)
    }

    /// Arm a one-shot timer that resets backup state to idle after `after`.
    /// A pending timer is left alone. Must run inside a tokio runtime.
    pub fn schedule_backup_cooldown(self: &Arc<Self>, after: Duration) {
        if self.cooldown_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            coordinator.reset_backup_progress();
            coordinator.cooldown_armed.store(false, Ordering::SeqCst);
            tracing::debug!("backup cooldown elapsed, state reset to idle");
        });
    }

    /// Atomically claim the completed backup for download. The check and the
    /// state transition happen under one write lock, so of any number of
    /// concurrent fetchers exactly one gets the file; the rest see "doesn't
    /// exist" until a new backup runs.
    pub fn try_claim_backup(&self, backup_path: &Path) -> bool {
        let mut progress = self.backup_progress.write().expect("backup lock poisoned");
        if *progress == 100 && backup_path.exists() {
            *progress = -1;
            true
        } else {
            false
        }
    }

    /// Put a claimed backup back after a transfer that never completed.
    pub fn unclaim_backup(&self) {
        self.set_backup_progress(100);
    }

    // ---- staged writes ---------------------------------------------------

    /// Execute a write directly when no backup is in flight, otherwise park
    /// it in the staging queue. Returns the affected-row count, or the staged
    /// rowid when parked.
    ///
    /// Blocking; run off the event loop.
    pub fn execute_or_stage(
        &self,
        store: &TransactionalStore,
        sql: &str,
    ) -> Result<i64, SessionError> {
        let progress = self.backup_progress();
        if progress < 0 || progress == 100 {
            Ok(store.execute_write(sql)?)
        } else {
            let id = self.staging.push(sql)?;
            tracing::debug!(staged_id = id, "write staged while backup runs");
            Ok(id)
        }
    }

    /// Replay staged writes against the main database, oldest first, one at
    /// a time, deleting each row once attempted.
    ///
    /// A statement that fails is logged and skipped; the pass never stalls on
    /// one bad write. A transiently unavailable main store is retried with a
    /// bounded reconnect loop. A second concurrent trigger returns
    /// immediately. Blocking; run off the event loop.
    pub fn sync_staged_writes(&self, main_db_path: &Path) -> Result<(), SessionError> {
        let Ok(_guard) = self.sync_gate.try_lock() else {
            tracing::debug!("staged-write sync already running, skipping");
            return Ok(());
        };

        let mut main = TransactionalStore::new(main_db_path, self.retry.clone());
        if let Err(err) = main.open() {
            tracing::warn!(error = %err, "main store not reachable at sync start");
        }

        loop {
            // give other connections a chance between statements
            std::thread::sleep(self.sync_pause);

            let mut tries = 0;
            while !main.is_connected() && tries < SYNC_RECONNECT_TRIES {
                tries += 1;
                tracing::warn!(attempt = tries, "main db is not connected, reconnecting");
                std::thread::sleep(SYNC_RECONNECT_PAUSE);
                if let Err(err) = main.open() {
                    tracing::warn!(error = %err, "reconnect failed");
                }
            }
            if !main.is_connected() {
                return Err(SessionError::logic(format!(
                    "can't connect to '{}' for staged-write sync",
                    main_db_path.display()
                )));
            }

            let Some((rowid, sql)) = self.staging.front()? else {
                break; // queue drained, sync complete
            };

            if let Err(err) = main.execute_write(&sql) {
                tracing::warn!(rowid, error = %err, statement = %sql, "staged write failed, skipping");
            }

            self.staging.remove(rowid)?;
        }

        tracing::info!("staged-write sync complete");
        Ok(())
    }

    // ---- cached scalar ---------------------------------------------------

    pub fn cached_place_free(&self) -> String {
        self.place_free.get()
    }

    /// Load the scalar on first use.
    pub fn ensure_place_free(&self, store: &TransactionalStore) -> Result<(), SessionError> {
        if self.place_free.is_unset() {
            self.refresh_place_free(store)?;
        }
        Ok(())
    }

    /// Apply an update statement, then re-select the scalar so the cache
    /// follows the database. Blocking; run off the event loop.
    pub fn update_place_free(
        &self,
        store: &TransactionalStore,
        update_sql: &str,
    ) -> Result<(), SessionError> {
        store.execute_write(update_sql)?;
        self.refresh_place_free(store)
    }

    fn refresh_place_free(&self, store: &TransactionalStore) -> Result<(), SessionError> {
        let mut set = store.execute_select(PLACE_FREE_SELECT)?;

        let mut result = String::new();
        while set.next() {
            for i in 0..set.column_count() {
                result.push_str(set.column_text(i).unwrap_or("NONE"));
            }
        }

        if result.is_empty() {
            return Err(SessionError::logic("db returned empty string"));
        }

        // the value must be numeric; "0" is the one allowed non-positive
        if result != "0" && !result.parse::<u64>().is_ok_and(|n| n > 0) {
            return Err(SessionError::logic(format!(
                "can't convert '{result}' to number!"
            )));
        }

        self.place_free.set(result);
        Ok(())
    }

    // ---- restore ---------------------------------------------------------

    pub fn restore_progress(&self) -> i32 {
        *self.restore_progress.read().expect("restore lock poisoned")
    }

    pub fn restore_in_progress(&self) -> bool {
        self.restore_progress() > -1
    }

    fn set_restore_progress(&self, value: i32) {
        *self.restore_progress.write().expect("restore lock poisoned") = value;
    }

    pub fn reset_restore_progress(&self) {
        self.set_restore_progress(-1);
    }

    /// Validate a restore before any session is stopped: the candidate must
    /// be readable and integrity-clean, the main path writable. Any failure
    /// resets restore state to idle.
    ///
    /// Blocking; run off the event loop.
    pub fn prepare_restore(
        &self,
        main_db_path: &Path,
        restore_db_path: &Path,
    ) -> Result<(), SessionError> {
        self.set_restore_progress(0);

        if let Err(err) = File::open(restore_db_path) {
            self.reset_restore_progress();
            return Err(SessionError::logic(format!(
                "can't open for read restore file '{}': {err}",
                restore_db_path.display()
            )));
        }

        let writable = OpenOptions::new()
            .write(true)
            .create(true)
            .open(main_db_path);
        if let Err(err) = writable {
            self.reset_restore_progress();
            return Err(SessionError::logic(format!(
                "can't open for write current db file '{}': {err}",
                main_db_path.display()
            )));
        }

        let mut candidate = TransactionalStore::new(restore_db_path, self.retry.clone());
        if let Err(err) = candidate.open() {
            self.reset_restore_progress();
            return Err(SessionError::logic(format!(
                "can't open restore db '{}': {err}",
                restore_db_path.display()
            )));
        }
        if !candidate.integrity_check() {
            self.reset_restore_progress();
            return Err(SessionError::logic(format!(
                "integrity check failed for '{}'",
                restore_db_path.display()
            )));
        }

        tracing::info!(restore = %restore_db_path.display(), "restore db integrity check OK");
        Ok(())
    }

    /// Copy the restore file over the main database in fixed chunks,
    /// publishing progress as it goes. Callers must have stopped every other
    /// session first; this method assumes exclusive access to the main file.
    ///
    /// The post-copy integrity check on the new main file is logged but not
    /// fatal: the restore is considered complete either way. Restore state is
    /// reset to idle on every exit path. Blocking; run off the event loop.
    pub fn restore_from_file(
        &self,
        main_db_path: &Path,
        restore_db_path: &Path,
    ) -> Result<(), SessionError> {
        let outcome = self.copy_restore_file(main_db_path, restore_db_path);

        if outcome.is_ok() {
            let mut main = TransactionalStore::new(main_db_path, self.retry.clone());
            match main.open() {
                Ok(()) => {
                    if main.integrity_check() {
                        tracing::info!("main db integrity check OK after restore");
                    } else {
                        tracing::warn!("integrity check failed on restored main db");
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "can't open restored main db for integrity check");
                }
            }
            tracing::info!("restore db complete [100%]");
        }

        self.reset_restore_progress();
        outcome
    }

    fn copy_restore_file(
        &self,
        main_db_path: &Path,
        restore_db_path: &Path,
    ) -> Result<(), SessionError> {
        let mut reader = ChunkedFileReader::open(restore_db_path).map_err(|err| {
            SessionError::logic(format!(
                "can't open for read restore file '{}': {err}",
                restore_db_path.display()
            ))
        })?;
        let mut writer = File::create(main_db_path).map_err(|err| {
            SessionError::logic(format!(
                "can't open for write current db file '{}': {err}",
                main_db_path.display()
            ))
        })?;

        while let Some(chunk) = reader
            .next_chunk()
            .map_err(|err| SessionError::logic(format!("restore read failed: {err}")))?
        {
            writer
                .write_all(chunk)
                .map_err(|err| SessionError::logic(format!("restore write failed: {err}")))?;

            // hold 99 until the post-copy verification has run
            let progress = reader.progress().clamp(0, 99) as i32;
            self.set_restore_progress(progress);
            tracing::debug!(progress, "restore db in progress");
        }

        writer
            .sync_all()
            .map_err(|err| SessionError::logic(format!("restore sync failed: {err}")))?;
        Ok(())
    }
}

impl std::fmt::Debug for BackupRestoreCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupRestoreCoordinator")
            .field("backup_progress", &self.backup_progress())
            .field("restore_progress", &self.restore_progress())
            .field("staging_path", &self.staging.path())
            .finish()
    }
}
