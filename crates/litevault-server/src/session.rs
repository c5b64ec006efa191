//! Per-connection session: read loop, command dispatch, replies.
//!
//! Each session owns its read half and its own database connection. The write
//! half sits behind an async mutex shared with the detached backup and restore
//! tasks, so their ordered replies interleave safely with the loop's own.
//!
//! All store calls run in `spawn_blocking`; the busy-retry sleeps inside the
//! store never stall the event loop.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::task;

use litevault_store::{ChunkedFileReader, ResultSet, TransactionalStore};

use crate::error::SessionError;
use crate::protocol::{self, Command};
use crate::registry::SessionHandle;
use crate::server::ServerState;

const MAX_READ_BUFFER: usize = 4096;

/// What the read loop does after a dispatched command.
enum Flow {
    Continue,
    Stop,
}

type Writer = Arc<Mutex<OwnedWriteHalf>>;
type Store = Arc<StdMutex<TransactionalStore>>;

/// Write one sentinel-terminated reply.
async fn send(writer: &Writer, msg: &str) -> std::io::Result<()> {
    let mut frame = Vec::with_capacity(msg.len() + 1);
    frame.extend_from_slice(msg.as_bytes());
    frame.push(0);
    writer.lock().await.write_all(&frame).await
}

/// Best-effort variant for detached tasks: a dead peer is logged, not fatal.
async fn send_detached(writer: &Writer, msg: &str) {
    if let Err(err) = send(writer, msg).await {
        tracing::debug!(error = %err, "reply to a gone client dropped");
    }
}

/// Drive one accepted connection until the client leaves, idles out, errors,
/// or another task requests a stop.
pub(crate) async fn run(state: Arc<ServerState>, stream: TcpStream) {
    let handle = state.registry.register();
    let (mut read_half, write_half) = stream.into_split();
    let writer: Writer = Arc::new(Mutex::new(write_half));

    let store: Store = Arc::new(StdMutex::new(TransactionalStore::new(
        &state.config.db_path,
        state.config.retry.clone(),
    )));
    open_session_store(&store, state.config.page_size).await;

    tracing::debug!(session = handle.id(), "session started");

    let mut buffer = vec![0u8; MAX_READ_BUFFER];
    loop {
        let read = tokio::select! {
            _ = handle.stop_requested() => {
                tracing::debug!(session = handle.id(), "stop requested");
                break;
            }
            read = tokio::time::timeout(state.config.idle_timeout, read_half.read(&mut buffer)) => read,
        };

        let n = match read {
            Err(_) => {
                tracing::debug!(session = handle.id(), user = %handle.username(), "no command in time, stopping");
                break;
            }
            Ok(Err(err)) => {
                tracing::debug!(session = handle.id(), error = %err, "read failed");
                break;
            }
            Ok(Ok(0)) => break, // peer closed
            Ok(Ok(n)) => n,
        };

        let msg = protocol::strip_frame(&buffer[..n]);
        tracing::debug!(session = handle.id(), user = %handle.username(), msg = %msg, bytes = n, "received command");

        match dispatch(&state, &handle, &writer, &store, &msg).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop) => break,
            Err(err) => {
                tracing::debug!(session = handle.id(), error = %err, "write failed");
                break;
            }
        }
    }

    if handle.mark_stopped() {
        tracing::debug!(session = handle.id(), user = %handle.username(), "stop session");
        state.registry.remove(handle.id());
    }
}

async fn open_session_store(store: &Store, page_size: u32) {
    let store = Arc::clone(store);
    let opened = task::spawn_blocking(move || {
        let mut guard = store.lock().expect("store lock poisoned");
        guard.open()?;
        guard.apply_session_pragmas(page_size)
    })
    .await;

    match opened {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(error = %err, "can't connect session to db"),
        Err(err) => tracing::warn!(error = %err, "session store setup task failed"),
    }
}

async fn dispatch(
    state: &Arc<ServerState>,
    handle: &Arc<SessionHandle>,
    writer: &Writer,
    store: &Store,
    msg: &str,
) -> std::io::Result<Flow> {
    // a restore owns the database file; refuse everything and disconnect
    if state.coordinator.restore_in_progress() {
        let reply = format!(
            "Server is busy at the moment. Database restore progress [{}%]",
            state.coordinator.restore_progress()
        );
        send(writer, &reply).await?;
        return Ok(Flow::Stop);
    }

    match protocol::parse(msg) {
        Command::Login(name) => {
            if let Some(name) = name {
                handle.set_username(name);
                tracing::debug!(session = handle.id(), user = name, "logged in");
            }
            send(writer, "login ok\n").await?;
        }

        Command::Ping => {
            let reply = if handle.take_clients_changed() {
                "ping client_list_changed\n"
            } else {
                "ping OK\n"
            };
            send(writer, reply).await?;
        }

        Command::Who => {
            let mut reply = String::from("clients: ");
            for name in state.registry.usernames() {
                reply.push_str(&name);
                reply.push(' ');
            }
            reply.push('\n');
            send(writer, &reply).await?;
        }

        Command::Fibo(n) => {
            let reply = format!("fibo: {}\n", protocol::fibonacci(n));
            send(writer, &reply).await?;
        }

        Command::GetPlaceFree => {
            let reply = get_place_free(state, store).await;
            send(writer, &reply).await?;
        }

        Command::UpdatePlaceFree => {
            let reply = update_place_free(state, store, msg).await;
            send(writer, &reply).await?;
        }

        Command::BackupDb => {
            spawn_backup(state, writer, store);
        }

        Command::GetBackupProgress => {
            let progress = state.coordinator.backup_progress();
            let reply = if progress == -1 {
                "backup not started".to_string()
            } else {
                format!("backup in progress [{progress}%]")
            };
            tracing::debug!(session = handle.id(), %reply, "backup progress asked");
            send(writer, &reply).await?;
        }

        Command::GetBackup => {
            stream_backup_file(state, writer).await?;
        }

        Command::RestoreDb => {
            let reply = start_restore(state, handle).await;
            send(writer, &reply).await?;
        }

        Command::Exit => return Ok(Flow::Stop),

        Command::Query(sql) => {
            let reply = run_query(state, store, sql).await;
            send(writer, &reply).await?;
        }

        Command::TooShort => {
            tracing::warn!(user = %handle.username(), msg = %msg, "very short command");
            send(writer, &format!("ERROR: very short command:{msg}\n")).await?;
        }
    }

    Ok(Flow::Continue)
}

// ---- query ---------------------------------------------------------------

/// Render a result set the way clients expect: columns joined by `|`, one
/// row per line, NULL as `None`, an empty set as `NONE`.
fn format_select_rows(set: &mut ResultSet) -> String {
    let mut answer = String::new();
    while set.next() {
        for i in 0..set.column_count() {
            answer.push_str(set.column_text(i).unwrap_or("None"));
            answer.push('|');
        }
        answer.pop();
        answer.push('\n');
    }
    if answer.is_empty() {
        "NONE".to_string()
    } else {
        answer.pop();
        answer
    }
}

async fn run_query(state: &Arc<ServerState>, store: &Store, sql: &str) -> String {
    let coordinator = Arc::clone(&state.coordinator);
    let store = Arc::clone(store);
    let sql = sql.to_string();

    let reply = task::spawn_blocking(move || {
        let mut guard = store.lock().expect("store lock poisoned");
        if !guard.is_connected() {
            if let Err(err) = guard.open() {
                return format!("ERROR: {err}");
            }
        }

        if protocol::is_select(&sql) {
            match guard.execute_select(&sql) {
                Ok(mut set) => format_select_rows(&mut set),
                Err(err) => format!("ERROR: {err}"),
            }
        } else {
            match coordinator.execute_or_stage(&guard, &sql) {
                Ok(_) => "NONE".to_string(),
                Err(err) => format!("ERROR: effected data < 0! : {err}"),
            }
        }
    })
    .await;

    match reply {
        Ok(reply) => reply,
        Err(err) => format!("ERROR: {err}"),
    }
}

// ---- cached scalar -------------------------------------------------------

async fn get_place_free(state: &Arc<ServerState>, store: &Store) -> String {
    let coordinator = Arc::clone(&state.coordinator);
    let store = Arc::clone(store);

    let refreshed = task::spawn_blocking(move || {
        let guard = store.lock().expect("store lock poisoned");
        coordinator.ensure_place_free(&guard)
    })
    .await;

    let cached = state.coordinator.cached_place_free();
    match refreshed {
        Ok(Ok(())) => cached,
        // serve the last good value; "0" when it was never loaded
        _ if cached == "-1" => "0".to_string(),
        _ => cached,
    }
}

async fn update_place_free(state: &Arc<ServerState>, store: &Store, sql: &str) -> String {
    let progress = state.coordinator.backup_progress();
    if progress > -1 && progress < 100 {
        return format!("'UPDATE Config SET PlaceFree...'. Backup in progress [{progress}%]");
    }

    let coordinator = Arc::clone(&state.coordinator);
    let store = Arc::clone(store);
    let sql = sql.to_string();

    let updated = task::spawn_blocking(move || {
        let guard = store.lock().expect("store lock poisoned");
        coordinator.update_place_free(&guard, &sql)
    })
    .await;

    match updated {
        Ok(Ok(())) => "NONE".to_string(),
        Ok(Err(err)) => err.to_string(),
        Err(err) => err.to_string(),
    }
}

// ---- backup --------------------------------------------------------------

/// Run (or observe) the hot backup as a detached task, keeping the read loop
/// responsive. Two ordered replies on a fresh start: the `[0%]` ack, then the
/// outcome once the copy and verification finish.
fn spawn_backup(state: &Arc<ServerState>, writer: &Writer, store: &Store) {
    let state = Arc::clone(state);
    let writer = Arc::clone(writer);
    let store = Arc::clone(store);

    tokio::spawn(async move {
        let progress = state.coordinator.backup_progress();

        let outcome = if progress == -1 {
            send_detached(&writer, "backup in progress [0%]").await;

            let coordinator = Arc::clone(&state.coordinator);
            let blocking_store = Arc::clone(&store);
            let dest = state.config.backup_path.clone();
            match task::spawn_blocking(move || {
                let guard = blocking_store.lock().expect("store lock poisoned");
                coordinator.start_or_query_backup(&guard, &dest)
            })
            .await
            {
                Ok(outcome) => outcome,
                Err(err) => Err(SessionError::logic(err.to_string())),
            }
        } else {
            Ok(progress)
        };

        let reply = match outcome {
            Ok(100) => {
                state
                    .coordinator
                    .schedule_backup_cooldown(state.config.backup_cooldown);
                spawn_staged_sync(&state);
                tracing::info!("backup db complete [100%]");
                "backup db complete [100%]".to_string()
            }
            Ok(p) => format!("backup in progress [{p}%]"),
            Err(err) => {
                let msg = format!("ERROR: db was not backuped: {err}");
                tracing::warn!("{msg}");
                msg
            }
        };

        send_detached(&writer, &reply).await;
    });
}

/// Replay writes parked during the backup, off the event loop.
fn spawn_staged_sync(state: &Arc<ServerState>) {
    let coordinator = Arc::clone(&state.coordinator);
    let db_path = state.config.db_path.clone();

    tokio::spawn(async move {
        let synced =
            task::spawn_blocking(move || coordinator.sync_staged_writes(&db_path)).await;
        match synced {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "staged-write sync failed"),
            Err(err) => tracing::warn!(error = %err, "staged-write sync task failed"),
        }
    });
}

/// Send the completed backup file as raw chunks. The backup is claimed
/// atomically before the first byte goes out, so concurrent fetchers get it
/// at most once; a transfer that fails puts the claim back.
async fn stream_backup_file(state: &Arc<ServerState>, writer: &Writer) -> std::io::Result<Flow> {
    let backup_path = &state.config.backup_path;

    if !state.coordinator.try_claim_backup(backup_path) {
        tracing::info!("backup doesn't exist");
        send(
            writer,
            "NONE : Backup doesn't exist, you can send 'backup_db' to create new \
             and 'get_db_backup_progress' to check backup progress!",
        )
        .await?;
        return Ok(Flow::Continue);
    }

    let mut reader = match ChunkedFileReader::open(backup_path) {
        Ok(reader) => reader,
        Err(err) => {
            state.coordinator.unclaim_backup();
            let msg = format!("can't open backup file [{}]", backup_path.display());
            tracing::warn!(error = %err, "{msg}");
            send(writer, &format!("ERROR: {msg}")).await?;
            return Ok(Flow::Continue);
        }
    };

    if reader.file_size() == 0 {
        send(writer, "").await?;
        return Ok(Flow::Continue);
    }

    // raw bytes, no sentinel; chunk reads come from the page cache and are
    // short compared to the socket writes they feed
    let mut guard = writer.lock().await;
    loop {
        match reader.next_chunk() {
            Ok(Some(chunk)) => {
                if let Err(err) = guard.write_all(chunk).await {
                    drop(guard);
                    state.coordinator.unclaim_backup();
                    return Err(err);
                }
            }
            Ok(None) => break,
            Err(err) => {
                drop(guard);
                state.coordinator.unclaim_backup();
                tracing::warn!(error = %err, "can't read backup file");
                return Err(err);
            }
        }
    }
    drop(guard);

    tracing::info!(file = %backup_path.display(), "backup file sent and consumed");
    Ok(Flow::Continue)
}

// ---- restore -------------------------------------------------------------

/// Validate the restore candidate, then hand the database over to a detached
/// task: every other session is stopped, a grace period lets in-flight store
/// calls finish, the file is rewritten, and finally the initiator is stopped
/// too.
async fn start_restore(state: &Arc<ServerState>, handle: &Arc<SessionHandle>) -> String {
    let progress = state.coordinator.backup_progress();
    if progress > -1 && progress < 100 {
        let msg = format!("Restore can't be executed. Backup in progress [{progress}%]");
        tracing::warn!("{msg}");
        return msg;
    }

    let coordinator = Arc::clone(&state.coordinator);
    let main_path = state.config.db_path.clone();
    let restore_path = state.config.restore_path.clone();
    let prepared = task::spawn_blocking(move || {
        coordinator.prepare_restore(&main_path, &restore_path)
    })
    .await;

    match prepared {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "restore preparation failed");
            return "Restore can't be executed. System error or restore db corrupted".to_string();
        }
        Err(err) => {
            tracing::warn!(error = %err, "restore preparation task failed");
            return "Restore can't be executed. System error or restore db corrupted".to_string();
        }
    }

    let stopped = state.registry.stop_all_except(handle.id());
    tracing::info!(stopped, "stopping other sessions before restore");

    let state = Arc::clone(state);
    let handle = Arc::clone(handle);
    tokio::spawn(async move {
        // let in-flight store calls drain and stopped clients go away
        tokio::time::sleep(state.config.restore_grace).await;

        let coordinator = Arc::clone(&state.coordinator);
        let main_path = state.config.db_path.clone();
        let restore_path = state.config.restore_path.clone();
        let restored = task::spawn_blocking(move || {
            coordinator.restore_from_file(&main_path, &restore_path)
        })
        .await;

        match restored {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "restore failed"),
            Err(err) => tracing::warn!(error = %err, "restore task failed"),
        }

        handle.request_stop();
    });

    tracing::info!("restore db in progress [0%]");
    "Restore db in progress [0%]".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use litevault_store::RetryPolicy;
    use std::time::Duration;
    use tempfile::tempdir;

    fn select(store: &TransactionalStore, sql: &str) -> ResultSet {
        store.execute_select(sql).unwrap()
    }

    #[test]
    fn select_rows_render_with_pipes_and_newlines() {
        let dir = tempdir().unwrap();
        let mut store = TransactionalStore::new(
            dir.path().join("t.db"),
            RetryPolicy {
                max_attempts: 1,
                wait: Duration::from_millis(1),
            },
        );
        store.open().unwrap();
        store
            .execute_write("CREATE TABLE t (a TEXT, b INTEGER)")
            .unwrap();
        store
            .execute_write("INSERT INTO t VALUES ('x', 1), (NULL, 2)")
            .unwrap();

        let mut set = select(&store, "SELECT a, b FROM t ORDER BY b");
        assert_eq!(format_select_rows(&mut set), "x|1\nNone|2");
    }

    #[test]
    fn empty_select_renders_none() {
        let dir = tempdir().unwrap();
        let mut store = TransactionalStore::new(
            dir.path().join("t.db"),
            RetryPolicy {
                max_attempts: 1,
                wait: Duration::from_millis(1),
            },
        );
        store.open().unwrap();
        store.execute_write("CREATE TABLE t (a TEXT)").unwrap();

        let mut set = select(&store, "SELECT a FROM t");
        assert_eq!(format_select_rows(&mut set), "NONE");
    }
}
