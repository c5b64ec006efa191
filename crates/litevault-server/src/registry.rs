//! Process-wide registry of live client sessions.
//!
//! Sessions are addressed by an opaque monotonically assigned [`SessionId`];
//! async tasks capture the id (or the shared handle), never a self-reference.
//! The list sits behind a single mutex; broadcast paths always iterate over a
//! snapshot copy taken under the lock, never the live list.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::Notify;

pub type SessionId = u64;

/// Shared per-session state reachable from other sessions and detached tasks.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    username: RwLock<String>,
    clients_changed: AtomicBool,
    stopped: AtomicBool,
    stop_signal: Notify,
}

impl SessionHandle {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            username: RwLock::new("user".to_string()),
            clients_changed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop_signal: Notify::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn username(&self) -> String {
        self.username.read().expect("username lock poisoned").clone()
    }

    pub fn set_username(&self, name: &str) {
        *self.username.write().expect("username lock poisoned") = name.to_string();
    }

    /// Mark that the client list changed since this session's last ping.
    pub fn set_clients_changed(&self) {
        self.clients_changed.store(true, Ordering::SeqCst);
    }

    /// Read and clear the changed flag (the notification is delivered once).
    pub fn take_clients_changed(&self) -> bool {
        self.clients_changed.swap(false, Ordering::SeqCst)
    }

    /// First caller wins; later calls observe an already-stopped session.
    pub fn mark_stopped(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Ask the owning read loop to wind down. The permit is stored, so the
    /// signal is not lost when the loop is mid-command.
    pub fn request_stop(&self) {
        self.stop_signal.notify_one();
    }

    pub async fn stop_requested(&self) {
        self.stop_signal.notified().await
    }
}

/// The set of active sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<Vec<Arc<SessionHandle>>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a handle for a freshly accepted connection.
    pub fn register(&self) -> Arc<SessionHandle> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = Arc::new(SessionHandle::new(id));
        self.sessions
            .lock()
            .expect("session list lock poisoned")
            .push(Arc::clone(&handle));
        handle
    }

    /// Remove a session and notify the survivors that the list changed.
    pub fn remove(&self, id: SessionId) {
        self.sessions
            .lock()
            .expect("session list lock poisoned")
            .retain(|s| s.id() != id);
        self.mark_all_changed();
    }

    /// Flag every registered session as having a stale client list.
    pub fn mark_all_changed(&self) {
        for session in self.snapshot() {
            session.set_clients_changed();
        }
    }

    fn snapshot(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions
            .lock()
            .expect("session list lock poisoned")
            .clone()
    }

    /// Display names in registration order.
    pub fn usernames(&self) -> Vec<String> {
        self.snapshot().iter().map(|s| s.username()).collect()
    }

    /// Request a stop on every session except `keep`; returns how many were
    /// signalled. Used by restore before it rewrites the main file.
    pub fn stop_all_except(&self, keep: SessionId) -> usize {
        let mut signalled = 0;
        for session in self.snapshot() {
            if session.id() != keep {
                session.request_stop();
                signalled += 1;
            }
        }
        signalled
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .expect("session list lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usernames_follow_registration_order() {
        let registry = SessionRegistry::new();
        let a = registry.register();
        let b = registry.register();
        a.set_username("alice");
        b.set_username("bob");

        assert_eq!(registry.usernames(), vec!["alice", "bob"]);
    }

    #[test]
    fn remove_notifies_survivors_once() {
        let registry = SessionRegistry::new();
        let a = registry.register();
        let b = registry.register();

        registry.remove(b.id());
        assert_eq!(registry.len(), 1);
        assert!(a.take_clients_changed());
        // flag is cleared after the first read
        assert!(!a.take_clients_changed());
    }

    #[test]
    fn stop_all_except_spares_the_initiator() {
        let registry = SessionRegistry::new();
        let keeper = registry.register();
        registry.register();
        registry.register();

        assert_eq!(registry.stop_all_except(keeper.id()), 2);
    }

    #[test]
    fn mark_stopped_is_first_caller_wins() {
        let registry = SessionRegistry::new();
        let handle = registry.register();
        assert!(handle.mark_stopped());
        assert!(!handle.mark_stopped());
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn stop_request_is_not_lost_when_no_waiter_is_parked() {
        let registry = SessionRegistry::new();
        let handle = registry.register();
        handle.request_stop();
        // notified() must complete from the stored permit
        handle.stop_requested().await;
    }
}
