//! Wire-protocol parsing for the line-oriented command protocol.
//!
//! Commands arrive as a sentinel-terminated byte chunk padded with NUL/CR/LF;
//! after stripping, the remainder is matched by case-sensitive prefix. Any
//! unrecognized text longer than ten characters is treated as opaque SQL.

/// A parsed inbound command.
#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    /// `login <name>`: set the session display name.
    Login(Option<&'a str>),
    Ping,
    Who,
    Fibo(u64),
    GetPlaceFree,
    /// `UPDATE Config SET PlaceFree...`: cached-scalar update, special-cased
    /// so it can be refused while a backup is running.
    UpdatePlaceFree,
    BackupDb,
    GetBackupProgress,
    GetBackup,
    RestoreDb,
    Exit,
    /// Opaque SQL passed through to the store.
    Query(&'a str),
    /// Unrecognized and too short to plausibly be SQL.
    TooShort,
}

/// Strip NUL/CR/LF padding from a raw read and decode the rest as text.
pub fn strip_frame(raw: &[u8]) -> String {
    let cleaned: Vec<u8> = raw
        .iter()
        .copied()
        .filter(|b| !matches!(b, 0 | b'\r' | b'\n'))
        .collect();
    String::from_utf8_lossy(&cleaned).into_owned()
}

/// Match a stripped command line. Prefix order follows the original protocol:
/// `get_db_backup_progress` must be tested before its prefix `get_db_backup`.
pub fn parse(msg: &str) -> Command<'_> {
    if msg.starts_with("UPDATE Config SET PlaceFree") {
        Command::UpdatePlaceFree
    } else if msg.starts_with("get_place_free") {
        Command::GetPlaceFree
    } else if msg.starts_with("restore_db") {
        Command::RestoreDb
    } else if msg.starts_with("backup_db") {
        Command::BackupDb
    } else if msg.starts_with("get_db_backup_progress") {
        Command::GetBackupProgress
    } else if msg.starts_with("get_db_backup") {
        Command::GetBackup
    } else if msg.starts_with("login ") {
        Command::Login(msg.split_whitespace().nth(1))
    } else if msg.starts_with("ping") {
        Command::Ping
    } else if msg.starts_with("who") {
        Command::Who
    } else if msg.starts_with("fibo ") {
        let n = msg[5..].trim().parse().unwrap_or(0);
        Command::Fibo(n)
    } else if msg.starts_with("exit") {
        Command::Exit
    } else if msg.len() > 10 {
        Command::Query(msg)
    } else {
        Command::TooShort
    }
}

/// True when the statement reads rather than writes: `select` appears within
/// the first ten characters, any case.
pub fn is_select(query: &str) -> bool {
    let head: String = query.chars().take(16).collect();
    head.to_ascii_lowercase()
        .find("select")
        .is_some_and(|pos| pos < 10)
}

/// Iterative Fibonacci, 1-indexed with an `a = b = 1` seed, so
/// `fibo(1) = fibo(2) = 1`. Wraps on overflow rather than panicking.
pub fn fibonacci(n: u64) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    let mut i = 3;
    while i <= n {
        let c = a.wrapping_add(b);
        a = b;
        b = c;
        i += 1;
    }
    b
}
