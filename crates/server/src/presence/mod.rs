//! Presence registry
//!
//! Volatile map of who holds a live connection right now. Rebuilt empty on
//! every start; never persisted.
//!
//! The primary table is keyed by connection id with a secondary
//! `user -> connection` index. Both sit behind one mutex and change together,
//! so a stale disconnect can never evict a newer connection for the same user.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::protocol::ServerEvent;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outbound side of one live connection. Equality is by connection id.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<ServerEvent>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            id: ConnectionId::new(),
            tx,
        }
    }

    /// Handle plus the receiving end the socket writer drains.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn sender(&self) -> &mpsc::Sender<ServerEvent> {
        &self.tx
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

#[derive(Default)]
struct Tables {
    by_connection: HashMap<ConnectionId, (String, ConnectionHandle)>,
    by_user: HashMap<String, ConnectionId>,
}

#[derive(Default)]
pub struct PresenceRegistry {
    inner: Mutex<Tables>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last writer wins: any previous connection for `user_id` is replaced.
    pub fn register(&self, user_id: &str, handle: ConnectionHandle) {
        let mut tables = self.inner.lock();
        let id = handle.id();

        if let Some(previous) = tables.by_user.insert(user_id.to_string(), id) {
            if previous != id {
                tables.by_connection.remove(&previous);
                debug!("Connection {} for {} replaced by {}", previous, user_id, id);
            }
        }
        // A connection identifies as one user at a time.
        if let Some((old_user, _)) = tables
            .by_connection
            .insert(id, (user_id.to_string(), handle))
        {
            if old_user != user_id && tables.by_user.get(&old_user) == Some(&id) {
                tables.by_user.remove(&old_user);
            }
        }

        info!("User {} online via connection {}", user_id, id);
    }

    pub fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        let tables = self.inner.lock();
        tables
            .by_user
            .get(user_id)
            .and_then(|id| tables.by_connection.get(id))
            .map(|(_, handle)| handle.clone())
    }

    /// Removes the entry for this connection, if it is still the live one.
    /// Returns the user that went offline. Safe to call repeatedly.
    pub fn unregister(&self, connection: ConnectionId) -> Option<String> {
        let mut tables = self.inner.lock();
        let (user_id, _) = tables.by_connection.remove(&connection)?;

        if tables.by_user.get(&user_id) == Some(&connection) {
            tables.by_user.remove(&user_id);
        }

        info!("User {} offline (connection {})", user_id, connection);
        Some(user_id)
    }

    /// User currently bound to `connection`, if any.
    pub fn user_for(&self, connection: ConnectionId) -> Option<String> {
        self.inner
            .lock()
            .by_connection
            .get(&connection)
            .map(|(user, _)| user.clone())
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.inner.lock().by_user.contains_key(user_id)
    }

    pub fn online_count(&self) -> usize {
        self.inner.lock().by_user.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn handle() -> ConnectionHandle {
        ConnectionHandle::channel(4).0
    }

    #[test]
    fn register_then_lookup() {
        let registry = PresenceRegistry::new();
        let h = handle();
        assert!(registry.lookup("u1").is_none());

        registry.register("u1", h.clone());
        assert_eq!(registry.lookup("u1"), Some(h));
        assert!(registry.is_online("u1"));
        assert_eq!(registry.online_count(), 1);
    }

    #[test]
    fn stale_disconnect_keeps_new_connection() {
        let registry = PresenceRegistry::new();
        let h1 = handle();
        let h2 = handle();

        registry.register("u", h1.clone());
        registry.register("u", h2.clone());
        assert_eq!(registry.lookup("u"), Some(h2.clone()));

        assert_eq!(registry.unregister(h1.id()), None);
        assert_eq!(registry.lookup("u"), Some(h2.clone()));

        assert_eq!(registry.unregister(h2.id()), Some("u".to_string()));
        assert!(registry.lookup("u").is_none());
    }

    #[test]
    fn duplicate_disconnect_is_noop() {
        let registry = PresenceRegistry::new();
        let h = handle();
        registry.register("u", h.clone());

        assert!(registry.unregister(h.id()).is_some());
        assert!(registry.unregister(h.id()).is_none());
        assert_eq!(registry.online_count(), 0);
    }

    #[test]
    fn reidentifying_connection_moves_user() {
        let registry = PresenceRegistry::new();
        let h = handle();
        registry.register("a", h.clone());
        registry.register("b", h.clone());

        assert!(registry.lookup("a").is_none());
        assert_eq!(registry.lookup("b"), Some(h.clone()));
        assert_eq!(registry.user_for(h.id()), Some("b".to_string()));
    }

    #[test]
    fn concurrent_register_and_disconnect() {
        let registry = Arc::new(PresenceRegistry::new());
        let handles: Vec<_> = (0..32).map(|_| handle()).collect();

        let threads: Vec<_> = handles
            .iter()
            .cloned()
            .map(|h| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry.register("shared", h.clone());
                    registry.unregister(h.id());
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        // Every handle was unregistered after its own register; nothing may linger.
        assert!(registry.lookup("shared").is_none());
        assert_eq!(registry.online_count(), 0);
    }
}
