use std::sync::Arc;

use dashmap::DashMap;

use crate::model::{ConnectionId, Uid};

/// Process-wide map of online users to their active connection.
///
/// Entries are advisory and never persisted. A user maps to at most one
/// connection; a newer connect replaces the older mapping.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    online: Arc<DashMap<Uid, ConnectionId>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `uid` to `connection`, returning the connection it replaced.
    pub fn set_online(&self, uid: &str, connection: &str) -> Option<ConnectionId> {
        self.online
            .insert(uid.to_string(), connection.to_string())
            .filter(|previous| previous != connection)
    }

    pub fn set_offline(&self, uid: &str) -> Option<ConnectionId> {
        self.online.remove(uid).map(|(_, connection)| connection)
    }

    /// Removes the mapping only if it still points at `connection`.
    ///
    /// Used on disconnect so a stale connection closing late cannot evict the
    /// session that replaced it.
    pub fn release(&self, uid: &str, connection: &str) -> bool {
        self.online
            .remove_if(uid, |_, current| current == connection)
            .is_some()
    }

    pub fn is_online(&self, uid: &str) -> bool {
        self.online.contains_key(uid)
    }

    pub fn connection_of(&self, uid: &str) -> Option<ConnectionId> {
        self.online.get(uid).map(|entry| entry.value().clone())
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn last_connect_wins() {
        let presence = PresenceRegistry::new();
        assert_eq!(presence.set_online("alice", "c1"), None);
        assert_eq!(presence.set_online("alice", "c2"), Some("c1".to_string()));
        assert_eq!(presence.connection_of("alice").as_deref(), Some("c2"));

        // The replaced connection closing afterwards must not evict c2.
        assert!(!presence.release("alice", "c1"));
        assert!(presence.is_online("alice"));
        assert!(presence.release("alice", "c2"));
        assert!(!presence.is_online("alice"));
    }

    #[test_timeout::timeout]
    fn reconnecting_on_the_same_connection_is_not_a_replacement() {
        let presence = PresenceRegistry::new();
        presence.set_online("alice", "c1");
        assert_eq!(presence.set_online("alice", "c1"), None);
        assert_eq!(presence.set_offline("alice"), Some("c1".to_string()));
        assert_eq!(presence.connection_of("alice"), None);
    }

    #[test_timeout::tokio_timeout_test]
    async fn concurrent_connect_and_disconnect_leave_one_mapping() {
        for _ in 0..50 {
            let presence = PresenceRegistry::new();
            presence.set_online("alice", "old");

            let a = presence.clone();
            let b = presence.clone();
            let connect = tokio::spawn(async move {
                tokio::task::yield_now().await;
                a.set_online("alice", "new");
            });
            let disconnect = tokio::spawn(async move {
                tokio::task::yield_now().await;
                b.release("alice", "old");
            });
            connect.await.unwrap();
            disconnect.await.unwrap();

            assert_eq!(presence.connection_of("alice").as_deref(), Some("new"));
            assert_eq!(presence.online_count(), 1);
        }
    }
}
