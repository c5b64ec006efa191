//! End-to-end tests over a real TCP connection: commands framed with a NUL
//! sentinel, replies read back frame by frame.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use litevault_server::{Server, ServerConfig, ServerState};
use litevault_store::TransactionalStore;
use tempfile::TempDir;

struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    _dir: TempDir,
}

async fn spawn_server(mutate: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ServerConfig {
        db_path: dir.path().join("main.db"),
        backup_path: dir.path().join("main.bak.db"),
        restore_path: dir.path().join("restore.db"),
        staging_path: dir.path().join("staging.db"),
        restore_grace: Duration::from_millis(100),
        sync_pause: Duration::from_millis(1),
        ..ServerConfig::default()
    };
    mutate(&mut config);

    {
        let mut store = TransactionalStore::with_defaults(&config.db_path);
        store.open().unwrap();
        store
            .execute_write("CREATE TABLE Config (PlaceFree TEXT NOT NULL)")
            .unwrap();
        store
            .execute_write("INSERT INTO Config (PlaceFree) VALUES ('2048')")
            .unwrap();
        store.close();
    }

    let server = Server::preflight(config).unwrap();
    let state = Arc::clone(server.state());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    TestServer {
        addr,
        state,
        _dir: dir,
    }
}

struct TestClient {
    stream: TcpStream,
    pending: Vec<u8>,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            stream,
            pending: Vec::new(),
        }
    }

    async fn send(&mut self, cmd: &str) {
        let mut frame = Vec::with_capacity(cmd.len() + 1);
        frame.extend_from_slice(cmd.as_bytes());
        frame.push(0);
        self.stream.write_all(&frame).await.unwrap();
    }

    /// Read one sentinel-terminated reply frame.
    async fn recv(&mut self) -> String {
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == 0) {
                let frame: Vec<u8> = self.pending.drain(..=pos).collect();
                return String::from_utf8_lossy(&frame[..frame.len() - 1]).into_owned();
            }
            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "server closed the connection mid-frame");
            self.pending.extend_from_slice(&buf[..n]);
        }
    }

    /// Read exactly `len` raw bytes (a file transfer, no sentinel).
    async fn recv_raw(&mut self, len: usize) -> Vec<u8> {
        let mut data = std::mem::take(&mut self.pending);
        while data.len() < len {
            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "server closed during file transfer");
            data.extend_from_slice(&buf[..n]);
        }
        self.pending = data.split_off(len);
        data
    }

    async fn roundtrip(&mut self, cmd: &str) -> String {
        self.send(cmd).await;
        self.recv().await
    }

    /// Read the outcome of an already-sent `get_db_backup`: true when the
    /// raw file payload arrived, false on the "doesn't exist" frame.
    async fn backup_outcome(&mut self, file_len: usize) -> bool {
        let mut first = [0u8; 1];
        self.stream.read_exact(&mut first).await.unwrap();
        self.pending.insert(0, first[0]);
        if first[0] == b'S' {
            let raw = self.recv_raw(file_len).await;
            assert_eq!(&raw[..16], b"SQLite format 3\0");
            true
        } else {
            let reply = self.recv().await;
            assert!(reply.starts_with("NONE : Backup doesn't exist"), "got: {reply}");
            false
        }
    }

    /// True when the server closed this connection.
    async fn closed(&mut self) -> bool {
        let mut buf = [0u8; 64];
        matches!(self.stream.read(&mut buf).await, Ok(0))
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn login_who_and_change_notification() {
    let server = spawn_server(|_| {}).await;
    // the first roundtrip pins each session's registration order
    let mut alice = TestClient::connect(server.addr).await;
    assert_eq!(alice.roundtrip("login alice").await, "login ok\n");
    let mut bob = TestClient::connect(server.addr).await;
    assert_eq!(bob.roundtrip("login bob").await, "login ok\n");

    assert_eq!(alice.roundtrip("who").await, "clients: alice bob \n");
    assert_eq!(alice.roundtrip("ping").await, "ping OK\n");

    bob.send("exit").await;
    let registry = Arc::clone(&server.state);
    wait_for(move || registry.registry.len() == 1).await;

    // the change is reported once, then the flag clears
    assert_eq!(alice.roundtrip("ping").await, "ping client_list_changed\n");
    assert_eq!(alice.roundtrip("ping").await, "ping OK\n");
}

#[tokio::test]
async fn fibo_and_short_commands() {
    let server = spawn_server(|_| {}).await;
    let mut client = TestClient::connect(server.addr).await;

    assert_eq!(client.roundtrip("fibo 10").await, "fibo: 55\n");
    assert_eq!(client.roundtrip("fibo 1").await, "fibo: 1\n");
    assert_eq!(
        client.roundtrip("zzz").await,
        "ERROR: very short command:zzz\n"
    );
}

#[tokio::test]
async fn opaque_sql_pass_through() {
    let server = spawn_server(|_| {}).await;
    let mut client = TestClient::connect(server.addr).await;

    assert_eq!(
        client
            .roundtrip("CREATE TABLE notes (body TEXT, score INTEGER)")
            .await,
        "NONE"
    );
    assert_eq!(
        client
            .roundtrip("INSERT INTO notes VALUES ('hello', 7), (NULL, 9)")
            .await,
        "NONE"
    );
    assert_eq!(
        client
            .roundtrip("select body, score from notes order by score")
            .await,
        "hello|7\nNone|9"
    );
    assert_eq!(
        client
            .roundtrip("select body from notes where score = 1000")
            .await,
        "NONE"
    );

    let reply = client.roundtrip("INSERT INTO nowhere VALUES (1)").await;
    assert!(reply.starts_with("ERROR:"), "got: {reply}");
}

#[tokio::test]
async fn place_free_is_cached_and_updated() {
    let server = spawn_server(|_| {}).await;
    let mut client = TestClient::connect(server.addr).await;

    assert_eq!(client.roundtrip("get_place_free").await, "2048");
    assert_eq!(
        client
            .roundtrip("UPDATE Config SET PlaceFree = '1024'")
            .await,
        "NONE"
    );
    assert_eq!(client.roundtrip("get_place_free").await, "1024");
}

#[tokio::test]
async fn backup_then_download_then_gone() {
    let server = spawn_server(|_| {}).await;
    let mut client = TestClient::connect(server.addr).await;

    // two ordered replies: the ack, then the outcome
    client.send("backup_db").await;
    assert_eq!(client.recv().await, "backup in progress [0%]");
    assert_eq!(client.recv().await, "backup db complete [100%]");

    assert_eq!(
        client.roundtrip("get_db_backup_progress").await,
        "backup in progress [100%]"
    );

    let backup_len = std::fs::metadata(&server.state.config.backup_path)
        .unwrap()
        .len() as usize;
    assert!(backup_len > 0);

    client.send("get_db_backup").await;
    let raw = client.recv_raw(backup_len).await;
    // a SQLite file starts with a fixed magic header
    assert_eq!(&raw[..16], b"SQLite format 3\0");

    // the transfer consumed the backup
    let reply = client.roundtrip("get_db_backup").await;
    assert!(reply.starts_with("NONE : Backup doesn't exist"), "got: {reply}");
}

#[tokio::test]
async fn concurrent_downloads_deliver_the_backup_once() {
    let server = spawn_server(|_| {}).await;
    let mut a = TestClient::connect(server.addr).await;
    let mut b = TestClient::connect(server.addr).await;

    a.send("backup_db").await;
    assert_eq!(a.recv().await, "backup in progress [0%]");
    assert_eq!(a.recv().await, "backup db complete [100%]");

    let backup_len = std::fs::metadata(&server.state.config.backup_path)
        .unwrap()
        .len() as usize;

    // both fetch before either reads a byte back
    a.send("get_db_backup").await;
    b.send("get_db_backup").await;

    let a_won = a.backup_outcome(backup_len).await;
    let b_won = b.backup_outcome(backup_len).await;
    assert!(a_won != b_won, "exactly one client must receive the file");
}

#[tokio::test]
async fn backup_progress_starts_not_started() {
    let server = spawn_server(|_| {}).await;
    let mut client = TestClient::connect(server.addr).await;

    assert_eq!(
        client.roundtrip("get_db_backup_progress").await,
        "backup not started"
    );
}

#[tokio::test]
async fn idle_session_is_dropped() {
    let server = spawn_server(|c| c.idle_timeout = Duration::from_millis(150)).await;
    let mut client = TestClient::connect(server.addr).await;

    assert_eq!(client.roundtrip("ping").await, "ping OK\n");
    // no command within the window: the server hangs up
    assert!(client.closed().await);
}

#[tokio::test]
async fn pinging_session_survives_the_idle_window() {
    let server = spawn_server(|c| c.idle_timeout = Duration::from_millis(200)).await;
    let mut client = TestClient::connect(server.addr).await;

    // several windows' worth of pings, each well inside the timeout
    for _ in 0..15 {
        assert_eq!(client.roundtrip("ping").await, "ping OK\n");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(client.roundtrip("who").await, "clients: user \n");
}

#[tokio::test]
async fn restore_fails_cleanly_without_a_candidate_file() {
    let server = spawn_server(|_| {}).await;
    let mut client = TestClient::connect(server.addr).await;

    assert_eq!(
        client.roundtrip("restore_db").await,
        "Restore can't be executed. System error or restore db corrupted"
    );
    // the session survives a refused restore
    assert_eq!(client.roundtrip("ping").await, "ping OK\n");
}

#[tokio::test]
async fn restore_replaces_the_main_database() {
    let server = spawn_server(|_| {}).await;
    let restore_path = server.state.config.restore_path.clone();

    // a standalone candidate with content the main db does not have
    {
        let mut candidate = TransactionalStore::with_defaults(&restore_path);
        candidate.open().unwrap();
        candidate
            .execute_write("CREATE TABLE Config (PlaceFree TEXT NOT NULL)")
            .unwrap();
        candidate
            .execute_write("INSERT INTO Config (PlaceFree) VALUES ('4242')")
            .unwrap();
        candidate.close();
    }

    let mut bystander = TestClient::connect(server.addr).await;
    assert_eq!(bystander.roundtrip("ping").await, "ping OK\n");

    let mut initiator = TestClient::connect(server.addr).await;
    assert_eq!(
        initiator.roundtrip("restore_db").await,
        "Restore db in progress [0%]"
    );

    // every session is stopped: the bystander immediately, the initiator
    // once the copy finishes
    assert!(bystander.closed().await);
    assert!(initiator.closed().await);

    let registry = Arc::clone(&server.state);
    wait_for(move || registry.registry.is_empty()).await;

    let mut fresh = TestClient::connect(server.addr).await;
    assert_eq!(
        fresh.roundtrip("select PlaceFree from Config").await,
        "4242"
    );
}
