//! Shared fixtures for unit tests.

use std::sync::Arc;

use parlor_core::{ChannelId, UserId, WorldId};
use parlor_settings::GatewaySettings;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::backend::memory::{Seed, SeedChannel, SeedUser};
use crate::backend::{Collaborators, MemoryBackend};
use crate::gateway::Gateway;
use crate::model::Identity;
use crate::rpc::types::IdentifyBody;
use crate::websocket::connection::ClientConnection;

/// A connection backed by a bare channel instead of a socket.
pub(crate) fn fake_connection() -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
    let (tx, rx) = mpsc::channel(64);
    (Arc::new(ClientConnection::new(tx)), rx)
}

pub(crate) fn identity(user: &str, is_bot: bool) -> Identity {
    Identity {
        user_id: UserId::from(user),
        nickname: user.to_owned(),
        avatar: None,
        is_bot,
        is_guest: false,
        is_observer: false,
    }
}

/// A connection with `user` bound but not registered anywhere.
pub(crate) fn identified(
    user: &str,
    is_bot: bool,
) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
    let (conn, rx) = fake_connection();
    assert!(conn.bind_identity(identity(user, is_bot)));
    (conn, rx)
}

/// Every frame queued so far, decoded.
pub(crate) fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(serde_json::from_str(&frame).unwrap());
    }
    frames
}

/// Frames of one event type.
pub(crate) fn events_of(frames: &[Value], kind: &str) -> Vec<Value> {
    frames
        .iter()
        .filter(|f| f["type"] == kind)
        .cloned()
        .collect()
}

fn user(id: &str, is_bot: bool) -> SeedUser {
    SeedUser {
        id: UserId::from(id),
        nickname: id.to_owned(),
        token: format!("t-{id}"),
        avatar: None,
        is_bot,
    }
}

/// alice, bob, carol and dicebot; `tavern` (bot channel, dice off),
/// `lobby` (public) and `vault` (carol only).
pub(crate) fn seed() -> Seed {
    let ids = |names: &[&str]| names.iter().map(|n| UserId::from(*n)).collect::<Vec<_>>();
    Seed {
        users: vec![
            user("alice", false),
            user("bob", false),
            user("carol", false),
            user("dicebot", true),
        ],
        channels: vec![
            SeedChannel {
                id: ChannelId::from("tavern"),
                world_id: WorldId::from("w1"),
                name: "Tavern".into(),
                public: false,
                members: ids(&["alice", "bob", "carol"]),
                admins: ids(&["alice"]),
                bot_id: Some(UserId::from("dicebot")),
                built_in_dice_enabled: Some(false),
                bot_feature_enabled: true,
            },
            SeedChannel {
                id: ChannelId::from("lobby"),
                world_id: WorldId::from("w1"),
                name: "Lobby".into(),
                public: true,
                members: ids(&["alice", "bob"]),
                admins: Vec::new(),
                bot_id: None,
                built_in_dice_enabled: None,
                bot_feature_enabled: false,
            },
            SeedChannel {
                id: ChannelId::from("vault"),
                world_id: WorldId::from("w2"),
                name: "Vault".into(),
                public: false,
                members: ids(&["carol"]),
                admins: ids(&["carol"]),
                bot_id: None,
                built_in_dice_enabled: None,
                bot_feature_enabled: false,
            },
        ],
    }
}

pub(crate) fn test_gateway_with(settings: GatewaySettings) -> (Arc<Gateway>, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::from_seed(seed()));
    let gateway = Gateway::new(settings, Collaborators::from_backend(backend.clone()));
    (Arc::new(gateway), backend)
}

pub(crate) fn test_gateway() -> (Arc<Gateway>, Arc<MemoryBackend>) {
    test_gateway_with(GatewaySettings::default())
}

/// Identify a fresh connection as seeded user `user` and register it.
pub(crate) async fn connect(
    gateway: &Gateway,
    user: &str,
) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
    let (conn, rx) = fake_connection();
    let body = IdentifyBody {
        credential: format!("t-{user}"),
        observer: false,
    };
    let _ = gateway.identify(&conn, body).await.unwrap();
    (conn, rx)
}

/// Identify `user` and enter `channel`.
pub(crate) async fn connect_in(
    gateway: &Gateway,
    user: &str,
    channel: &str,
) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
    let (conn, rx) = connect(gateway, user).await;
    let _ = gateway
        .enter_channel(&conn, &ChannelId::from(channel))
        .await
        .unwrap();
    (conn, rx)
}
