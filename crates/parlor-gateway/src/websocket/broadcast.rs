//! Event fan-out to connected `WebSocket` clients.
//!
//! Every shape snapshots its recipients, stamps the event with the dispatch
//! time, serializes once and queues the same frame on each connection.
//! Delivery is best effort: a full or closed queue drops the frame for that
//! connection only.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use metrics::counter;
use parlor_core::clock::now_millis;
use parlor_core::{ChannelId, UserId};
use tracing::{debug, warn};

use super::connection::ClientConnection;
use super::registry::ConnectionRegistry;
use crate::bot_relay::{self, MessageContext};
use crate::metrics::{BROADCAST_DROPS_TOTAL, BROADCAST_EVENTS_TOTAL};
use crate::rpc::types::ServerEvent;

/// Fan-out routines over the connection registry.
pub struct EventBroadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl EventBroadcaster {
    /// Create a broadcaster over `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Every connection of every user. Returns the number of deliveries.
    pub fn broadcast_all(&self, event: ServerEvent) -> usize {
        let conns = self.registry.all();
        fan_out(&conns, event, "all")
    }

    /// Every connection that has entered `channel`.
    pub fn broadcast_channel(&self, channel: &ChannelId, event: ServerEvent) -> usize {
        let conns = self.registry.channel_connections(channel);
        fan_out(&conns, event, "channel")
    }

    /// Connections in `channel` whose user is in `recipients`.
    pub fn broadcast_channel_to(
        &self,
        channel: &ChannelId,
        recipients: &HashSet<UserId>,
        event: ServerEvent,
    ) -> usize {
        let conns: Vec<_> = self
            .registry
            .channel_connections(channel)
            .into_iter()
            .filter(|c| c.user_id().is_some_and(|u| recipients.contains(u)))
            .collect();
        fan_out(&conns, event, "targeted")
    }

    /// Connections in `channel` whose user is not in `excluded`.
    pub fn broadcast_channel_except(
        &self,
        channel: &ChannelId,
        excluded: &HashSet<UserId>,
        event: ServerEvent,
    ) -> usize {
        let conns: Vec<_> = self
            .registry
            .channel_connections(channel)
            .into_iter()
            .filter(|c| c.user_id().is_some_and(|u| !excluded.contains(u)))
            .collect();
        fan_out(&conns, event, "excluding")
    }

    /// Connections in `channel`, each user receiving the event `build`
    /// makes for them (nothing when it returns `None`).
    pub fn broadcast_channel_per_user(
        &self,
        channel: &ChannelId,
        mut build: impl FnMut(&UserId) -> Option<ServerEvent>,
    ) -> usize {
        let mut by_user: HashMap<UserId, Vec<Arc<ClientConnection>>> = HashMap::new();
        for conn in self.registry.channel_connections(channel) {
            if let Some(user) = conn.user_id().cloned() {
                by_user.entry(user).or_default().push(conn);
            }
        }
        by_user
            .iter()
            .filter_map(|(user, conns)| build(user).map(|event| fan_out(conns, event, "per_user")))
            .sum()
    }

    /// The most recently alive session of `bot`, if it has one.
    pub fn bot_connection(&self, bot: &UserId) -> Option<Arc<ClientConnection>> {
        self.registry
            .user_connections(bot)
            .into_iter()
            .filter(|c| !c.is_closed())
            .max_by_key(|c| c.liveness())
    }

    /// Deliver `event` to the single freshest session of `bot` and record
    /// `context` on it. Returns whether a session received it.
    pub fn broadcast_to_bot(
        &self,
        bot: &UserId,
        context: &MessageContext,
        event: ServerEvent,
    ) -> bool {
        let Some(conn) = self.bot_connection(bot) else {
            debug!(bot = %bot, "no live bot session");
            return false;
        };
        bot_relay::record_relay(&conn, context);
        fan_out(std::slice::from_ref(&conn), event, "bot") == 1
    }
}

fn fan_out(conns: &[Arc<ClientConnection>], mut event: ServerEvent, shape: &'static str) -> usize {
    event.timestamp = now_millis();
    let json = match serde_json::to_string(&event) {
        Ok(j) => Arc::new(j),
        Err(e) => {
            warn!(event_type = event.kind.as_str(), error = %e, "failed to serialize event");
            return 0;
        }
    };
    let mut delivered = 0;
    for conn in conns {
        if conn.send(Arc::clone(&json)) {
            delivered += 1;
        } else {
            counter!(BROADCAST_DROPS_TOTAL).increment(1);
            warn!(conn_id = %conn.id, event_type = event.kind.as_str(), "failed to send event to client");
        }
    }
    counter!(BROADCAST_EVENTS_TOTAL, "shape" => shape).increment(1);
    debug!(
        event_type = event.kind.as_str(),
        shape,
        recipients = conns.len(),
        delivered,
        "broadcast event"
    );
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::types::EventKind;
    use crate::test_support::{drain, identified};
    use serde_json::json;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        broadcaster: EventBroadcaster,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        Fixture {
            broadcaster: EventBroadcaster::new(registry.clone()),
            registry,
        }
    }

    fn join(
        fx: &Fixture,
        user: &str,
        channel: Option<&str>,
    ) -> (Arc<ClientConnection>, tokio::sync::mpsc::Receiver<Arc<String>>) {
        let (conn, rx) = identified(user, false);
        conn.with_info(|i| i.channel_id = channel.map(ChannelId::from));
        let _ = fx.registry.insert(conn.clone(), 8);
        (conn, rx)
    }

    fn event() -> ServerEvent {
        ServerEvent::channel(EventKind::Notice, &ChannelId::from("tavern"), json!({"n": 1}))
    }

    #[test]
    fn channel_broadcast_reaches_only_that_channel() {
        let fx = fixture();
        let (_a, mut ra) = join(&fx, "alice", Some("tavern"));
        let (_b, mut rb) = join(&fx, "bob", Some("lobby"));
        let (_c, mut rc) = join(&fx, "carol", None);

        let n = fx.broadcaster.broadcast_channel(&ChannelId::from("tavern"), event());
        assert_eq!(n, 1);
        assert_eq!(drain(&mut ra).len(), 1);
        assert!(drain(&mut rb).is_empty());
        assert!(drain(&mut rc).is_empty());
    }

    #[test]
    fn whisper_reaches_each_recipient_connection_once() {
        let fx = fixture();
        let (_a1, mut ra1) = join(&fx, "alice", Some("tavern"));
        let (_a2, mut ra2) = join(&fx, "alice", Some("tavern"));
        let (_b, mut rb) = join(&fx, "bob", Some("tavern"));
        let (_c, mut rc) = join(&fx, "carol", Some("tavern"));
        let recipients = HashSet::from([UserId::from("alice"), UserId::from("bob")]);

        let n = fx
            .broadcaster
            .broadcast_channel_to(&ChannelId::from("tavern"), &recipients, event());
        assert_eq!(n, 3);
        assert_eq!(drain(&mut ra1).len(), 1);
        assert_eq!(drain(&mut ra2).len(), 1);
        assert_eq!(drain(&mut rb).len(), 1);
        assert!(drain(&mut rc).is_empty());
    }

    #[test]
    fn excluding_skips_listed_users() {
        let fx = fixture();
        let (_a, mut ra) = join(&fx, "alice", Some("tavern"));
        let (_b, mut rb) = join(&fx, "bob", Some("tavern"));
        let excluded = HashSet::from([UserId::from("alice")]);

        let n = fx
            .broadcaster
            .broadcast_channel_except(&ChannelId::from("tavern"), &excluded, event());
        assert_eq!(n, 1);
        assert!(drain(&mut ra).is_empty());
        assert_eq!(drain(&mut rb).len(), 1);
    }

    #[test]
    fn per_user_builds_one_event_per_viewer() {
        let fx = fixture();
        let (_a1, mut ra1) = join(&fx, "alice", Some("tavern"));
        let (_a2, mut ra2) = join(&fx, "alice", Some("tavern"));
        let (_b, mut rb) = join(&fx, "bob", Some("tavern"));
        let (_c, mut rc) = join(&fx, "carol", Some("lobby"));

        let tavern = ChannelId::from("tavern");
        let n = fx.broadcaster.broadcast_channel_per_user(&tavern, |user| {
            (user.as_str() == "alice").then(|| {
                ServerEvent::channel(EventKind::Notice, &tavern, json!({"for": user}))
            })
        });
        assert_eq!(n, 2);
        assert_eq!(drain(&mut ra1)[0]["data"]["for"], "alice");
        assert_eq!(drain(&mut ra2).len(), 1);
        assert!(drain(&mut rb).is_empty());
        assert!(drain(&mut rc).is_empty());
    }

    #[test]
    fn broadcast_all_ignores_channels() {
        let fx = fixture();
        let (_a, mut ra) = join(&fx, "alice", Some("tavern"));
        let (_b, mut rb) = join(&fx, "bob", None);
        assert_eq!(fx.broadcaster.broadcast_all(event()), 2);
        assert_eq!(drain(&mut ra).len(), 1);
        assert_eq!(drain(&mut rb).len(), 1);
    }

    #[test]
    fn events_are_stamped_at_dispatch() {
        let fx = fixture();
        let (_a, mut ra) = join(&fx, "alice", Some("tavern"));
        let before = now_millis();
        let _ = fx.broadcaster.broadcast_channel(&ChannelId::from("tavern"), event());
        let frames = drain(&mut ra);
        let ts = frames[0]["timestamp"].as_i64().unwrap();
        assert!(ts >= before);
        assert_eq!(frames[0]["type"], "notice");
    }

    #[test]
    fn full_queue_drops_only_that_connection() {
        let fx = fixture();
        let (tx, _rx_full) = tokio::sync::mpsc::channel(1);
        let slow = Arc::new(ClientConnection::new(tx));
        let _ = slow.bind_identity(crate::test_support::identity("slow", false));
        slow.with_info(|i| i.channel_id = Some(ChannelId::from("tavern")));
        let _ = fx.registry.insert(slow.clone(), 8);
        let (_a, mut ra) = join(&fx, "alice", Some("tavern"));

        let tavern = ChannelId::from("tavern");
        assert_eq!(fx.broadcaster.broadcast_channel(&tavern, event()), 2);
        assert_eq!(fx.broadcaster.broadcast_channel(&tavern, event()), 1);
        assert_eq!(slow.drop_count(), 1);
        assert_eq!(drain(&mut ra).len(), 2);
    }

    #[test]
    fn bot_variant_picks_freshest_session_and_records_context() {
        let fx = fixture();
        // registered as humans so the second insert keeps the first session
        let (stale, mut rs) = identified("dicebot", false);
        let (fresh, mut rf) = identified("dicebot", false);
        stale.with_info(|i| {
            i.last_alive = 10;
            i.last_ping = 10;
        });
        fresh.with_info(|i| i.last_alive = u64::MAX / 2);
        let _ = fx.registry.insert(stale.clone(), 8);
        let _ = fx.registry.insert(fresh.clone(), 8);

        let context = MessageContext {
            channel_id: ChannelId::from("tavern"),
            sender_id: UserId::from("alice"),
            message_id: parlor_core::MessageId::from("m1"),
            is_hidden_dice: true,
        };
        assert!(fx.broadcaster.broadcast_to_bot(
            &UserId::from("dicebot"),
            &context,
            ServerEvent::channel(EventKind::MessageRelay, &context.channel_id, json!({}))
        ));
        assert_eq!(drain(&mut rf).len(), 1);
        assert!(drain(&mut rs).is_empty());
        assert_eq!(fresh.snapshot().hidden_dice.len(), 1);
        assert!(stale.snapshot().hidden_dice.is_empty());

        assert!(!fx.broadcaster.broadcast_to_bot(
            &UserId::from("nobot"),
            &context,
            ServerEvent::channel(EventKind::MessageRelay, &context.channel_id, json!({}))
        ));
    }
}
