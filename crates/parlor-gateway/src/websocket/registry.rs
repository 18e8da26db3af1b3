//! Process-wide map of live connections, keyed by user.
//!
//! Every identified connection lives in exactly one per-user map. Per-user
//! maps are pruned as soon as they become empty.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parlor_core::{ChannelId, ConnectionId, UserId};

use super::connection::ClientConnection;

/// `UserId → {ConnectionId → connection}`.
#[derive(Default)]
pub struct ConnectionRegistry {
    users: DashMap<UserId, HashMap<ConnectionId, Arc<ClientConnection>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an identified connection, enforcing the per-user cap.
    ///
    /// Returns the connections that must be evicted to make room: every
    /// existing session when the newcomer is a bot, otherwise at most the
    /// single least-recently-alive session once the user already holds
    /// `cap` connections. The caller closes and tears down the returned
    /// connections; they are already gone from the registry.
    pub fn insert(&self, conn: Arc<ClientConnection>, cap: usize) -> Vec<Arc<ClientConnection>> {
        let Some(user) = conn.user_id().cloned() else {
            return Vec::new();
        };
        let mut entry = self.users.entry(user).or_default();
        let sessions = entry.value_mut();

        let mut evicted = Vec::new();
        if conn.is_bot() {
            evicted.extend(sessions.drain().map(|(_, c)| c));
        } else if sessions.len() >= cap.max(1) {
            let stalest = sessions
                .values()
                .min_by_key(|c| c.liveness())
                .map(|c| c.id.clone());
            if let Some(id) = stalest
                && let Some(old) = sessions.remove(&id)
            {
                evicted.push(old);
            }
        }
        let _ = sessions.insert(conn.id.clone(), conn);
        evicted
    }

    /// Remove one connection. Returns whether it was registered.
    pub fn remove(&self, user: &UserId, conn: &ConnectionId) -> bool {
        let mut removed = false;
        let _ = self.users.remove_if_mut(user, |_, sessions| {
            removed = sessions.remove(conn).is_some();
            sessions.is_empty()
        });
        removed
    }

    /// Every live connection of `user`.
    pub fn user_connections(&self, user: &UserId) -> Vec<Arc<ClientConnection>> {
        self.users
            .get(user)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every live connection.
    pub fn all(&self) -> Vec<Arc<ClientConnection>> {
        self.users
            .iter()
            .flat_map(|e| e.value().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Every live connection that has entered `channel`.
    pub fn channel_connections(&self, channel: &ChannelId) -> Vec<Arc<ClientConnection>> {
        self.users
            .iter()
            .flat_map(|e| {
                e.value()
                    .values()
                    .filter(|c| c.is_in_channel(channel))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Whether any connection of `user` other than `except` has entered
    /// `channel`.
    pub fn user_in_channel(
        &self,
        user: &UserId,
        channel: &ChannelId,
        except: Option<&ConnectionId>,
    ) -> bool {
        self.users.get(user).is_some_and(|sessions| {
            sessions
                .values()
                .any(|c| Some(&c.id) != except && c.is_in_channel(channel))
        })
    }

    /// Total live connections.
    pub fn connection_count(&self) -> usize {
        self.users.iter().map(|e| e.value().len()).sum()
    }

    /// Users with at least one live connection.
    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fake_connection, identified};

    #[test]
    fn insert_and_remove_prunes_user() {
        let reg = ConnectionRegistry::new();
        let (conn, _rx) = identified("alice", false);
        assert!(reg.insert(conn.clone(), 8).is_empty());
        assert_eq!(reg.connection_count(), 1);
        assert_eq!(reg.user_count(), 1);

        assert!(reg.remove(&UserId::from("alice"), &conn.id));
        assert!(!reg.remove(&UserId::from("alice"), &conn.id));
        assert_eq!(reg.connection_count(), 0);
        assert_eq!(reg.user_count(), 0);
    }

    #[test]
    fn unidentified_connection_is_not_registered() {
        let reg = ConnectionRegistry::new();
        let (conn, _rx) = fake_connection();
        assert!(reg.insert(conn, 8).is_empty());
        assert_eq!(reg.connection_count(), 0);
    }

    #[test]
    fn multi_device_user_keeps_all_sessions() {
        let reg = ConnectionRegistry::new();
        let (a, _ra) = identified("alice", false);
        let (b, _rb) = identified("alice", false);
        let _ = reg.insert(a.clone(), 8);
        let _ = reg.insert(b, 8);
        assert_eq!(reg.user_connections(&UserId::from("alice")).len(), 2);
        assert!(reg.remove(&UserId::from("alice"), &a.id));
        assert_eq!(reg.user_count(), 1);
    }

    #[test]
    fn cap_evicts_exactly_the_stalest() {
        let reg = ConnectionRegistry::new();
        let mut keep = Vec::new();
        for i in 0..3u64 {
            let (conn, rx) = identified("alice", false);
            conn.with_info(|info| {
                info.last_alive = 1_000 + i * 100;
                info.last_ping = 0;
            });
            assert!(reg.insert(conn.clone(), 3).is_empty());
            keep.push((conn, rx));
        }
        // the middle one pinged most recently of all
        keep[1].0.with_info(|info| info.last_ping = 5_000);
        // the first one is the stalest: alive at 1000
        let (newcomer, _rx) = identified("alice", false);
        let evicted = reg.insert(newcomer.clone(), 3);

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, keep[0].0.id);
        assert_eq!(reg.user_connections(&UserId::from("alice")).len(), 3);
        assert!(
            reg.user_connections(&UserId::from("alice"))
                .iter()
                .any(|c| c.id == newcomer.id)
        );
    }

    #[test]
    fn below_cap_evicts_nothing() {
        let reg = ConnectionRegistry::new();
        for _ in 0..4 {
            let (conn, _rx) = identified("alice", false);
            assert!(reg.insert(conn, 8).is_empty());
        }
        assert_eq!(reg.connection_count(), 4);
    }

    #[test]
    fn bot_replaces_all_previous_sessions() {
        let reg = ConnectionRegistry::new();
        let (b1, _r1) = identified("dicebot", true);
        let (b2, _r2) = identified("dicebot", true);
        let _ = reg.insert(b1.clone(), 8);
        let evicted = reg.insert(b2.clone(), 8);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, b1.id);
        let live = reg.user_connections(&UserId::from("dicebot"));
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, b2.id);
    }

    #[test]
    fn channel_queries() {
        let reg = ConnectionRegistry::new();
        let tavern = ChannelId::from("tavern");
        let (a1, _r1) = identified("alice", false);
        let (a2, _r2) = identified("alice", false);
        let (b, _r3) = identified("bob", false);
        for c in [&a1, &a2, &b] {
            let _ = reg.insert(c.clone(), 8);
        }
        a1.with_info(|i| i.channel_id = Some(tavern.clone()));
        a2.with_info(|i| i.channel_id = Some(tavern.clone()));

        assert_eq!(reg.channel_connections(&tavern).len(), 2);
        let alice = UserId::from("alice");
        assert!(reg.user_in_channel(&alice, &tavern, Some(&a1.id)));
        a2.with_info(|i| i.channel_id = None);
        assert!(!reg.user_in_channel(&alice, &tavern, Some(&a1.id)));
        assert!(reg.user_in_channel(&alice, &tavern, None));
        assert!(!reg.user_in_channel(&UserId::from("bob"), &tavern, None));
        assert_eq!(reg.all().len(), 3);
    }
}
