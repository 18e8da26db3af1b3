//! In-memory implementation of every collaborator trait.
//!
//! Backs the standalone binary and the test suites. State can be seeded
//! from a JSON file:
//!
//! ```json
//! {
//!   "users": [{"id": "alice", "nickname": "Alice", "token": "t-alice"}],
//!   "channels": [{"id": "tavern", "worldId": "w1", "name": "Tavern",
//!                 "members": ["alice"], "admins": ["alice"]}]
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::RwLock;
use parlor_core::{ChannelId, MessageId, StoreError, UserId, WorldId};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{
    BotSelector, ChannelDirectory, IdentityResolver, MessageStore, PermissionService,
    UnreadTracker,
};
use crate::model::{ChannelRecord, ChatMessage, ListPosition, UserProfile};

/// A user entry in a seed file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedUser {
    /// User ID.
    pub id: UserId,
    /// Display name.
    pub nickname: String,
    /// Credential presented in `identify`.
    pub token: String,
    /// Avatar URL.
    #[serde(default)]
    pub avatar: Option<String>,
    /// Automation client.
    #[serde(default)]
    pub is_bot: bool,
}

/// A channel entry in a seed file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedChannel {
    /// Channel ID.
    pub id: ChannelId,
    /// Owning world.
    pub world_id: WorldId,
    /// Display name.
    pub name: String,
    /// Readable by anyone, guests included.
    #[serde(default)]
    pub public: bool,
    /// Users who may read and write.
    #[serde(default)]
    pub members: Vec<UserId>,
    /// Users who moderate.
    #[serde(default)]
    pub admins: Vec<UserId>,
    /// Bot attached to the channel.
    #[serde(default)]
    pub bot_id: Option<UserId>,
    /// Built-in dice override.
    #[serde(default)]
    pub built_in_dice_enabled: Option<bool>,
    /// Bot feature switch.
    #[serde(default)]
    pub bot_feature_enabled: bool,
}

impl SeedChannel {
    fn record(&self) -> ChannelRecord {
        ChannelRecord {
            id: self.id.clone(),
            world_id: self.world_id.clone(),
            name: self.name.clone(),
            built_in_dice_enabled: self.built_in_dice_enabled,
            bot_feature_enabled: self.bot_feature_enabled,
        }
    }

    fn is_member(&self, user: &UserId) -> bool {
        self.members.contains(user)
            || self.admins.contains(user)
            || self.bot_id.as_ref() == Some(user)
    }
}

/// Seed file contents.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Seed {
    /// Known users.
    pub users: Vec<SeedUser>,
    /// Known channels.
    pub channels: Vec<SeedChannel>,
}

impl Seed {
    /// Read a seed from a JSON file.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    users: HashMap<UserId, SeedUser>,
    tokens: HashMap<String, UserId>,
    channels: HashMap<ChannelId, SeedChannel>,
    messages: HashMap<ChannelId, Vec<ChatMessage>>,
    read_markers: HashMap<(UserId, ChannelId), i64>,
}

/// Everything-in-a-`HashMap` backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend populated from `seed`.
    pub fn from_seed(seed: Seed) -> Self {
        let backend = Self::new();
        info!(
            users = seed.users.len(),
            channels = seed.channels.len(),
            "seeding in-memory backend"
        );
        for user in seed.users {
            backend.add_user(user);
        }
        for channel in seed.channels {
            backend.add_channel(channel);
        }
        backend
    }

    /// Register or replace a user.
    pub fn add_user(&self, user: SeedUser) {
        let mut state = self.state.write();
        let _ = state.tokens.insert(user.token.clone(), user.id.clone());
        let _ = state.users.insert(user.id.clone(), user);
    }

    /// Register or replace a channel.
    pub fn add_channel(&self, channel: SeedChannel) {
        let _ = self
            .state
            .write()
            .channels
            .insert(channel.id.clone(), channel);
    }

    /// Number of messages stored for `channel`, deleted ones included.
    pub fn message_count(&self, channel: &ChannelId) -> usize {
        self.state
            .read()
            .messages
            .get(channel)
            .map_or(0, Vec::len)
    }

    fn with_message<T>(
        &self,
        channel: &ChannelId,
        id: &MessageId,
        f: impl FnOnce(&mut ChatMessage) -> T,
    ) -> Result<T, StoreError> {
        let mut state = self.state.write();
        state
            .messages
            .get_mut(channel)
            .and_then(|msgs| msgs.iter_mut().find(|m| &m.id == id))
            .map(f)
            .ok_or_else(|| StoreError::not_found("message", id.as_str()))
    }

    fn channel_check(
        &self,
        channel: &ChannelId,
        check: impl FnOnce(&SeedChannel) -> bool,
    ) -> bool {
        self.state.read().channels.get(channel).is_some_and(check)
    }
}

#[async_trait]
impl IdentityResolver for MemoryBackend {
    async fn resolve(&self, credential: &str) -> Result<Option<UserProfile>, StoreError> {
        let state = self.state.read();
        Ok(state
            .tokens
            .get(credential)
            .and_then(|id| state.users.get(id))
            .map(|u| UserProfile {
                id: u.id.clone(),
                nickname: u.nickname.clone(),
                avatar: u.avatar.clone(),
                is_bot: u.is_bot,
            }))
    }
}

#[async_trait]
impl ChannelDirectory for MemoryBackend {
    async fn channel(&self, id: &ChannelId) -> Result<Option<ChannelRecord>, StoreError> {
        Ok(self.state.read().channels.get(id).map(SeedChannel::record))
    }

    async fn channels_for(&self, user: &UserId) -> Result<Vec<ChannelRecord>, StoreError> {
        let state = self.state.read();
        let mut channels: Vec<ChannelRecord> = state
            .channels
            .values()
            .filter(|c| c.public || c.is_member(user))
            .map(SeedChannel::record)
            .collect();
        channels.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(channels)
    }
}

#[async_trait]
impl PermissionService for MemoryBackend {
    async fn can_read(&self, user: &UserId, channel: &ChannelId) -> Result<bool, StoreError> {
        Ok(self.channel_check(channel, |c| c.public || c.is_member(user)))
    }

    async fn can_write(&self, user: &UserId, channel: &ChannelId) -> Result<bool, StoreError> {
        if user.is_guest() {
            return Ok(false);
        }
        Ok(self.channel_check(channel, |c| c.is_member(user)))
    }

    async fn is_channel_admin(
        &self,
        user: &UserId,
        channel: &ChannelId,
    ) -> Result<bool, StoreError> {
        Ok(self.channel_check(channel, |c| c.admins.contains(user)))
    }
}

#[async_trait]
impl MessageStore for MemoryBackend {
    async fn insert(&self, message: ChatMessage) -> Result<ChatMessage, StoreError> {
        let mut state = self.state.write();
        let msgs = state
            .messages
            .entry(message.channel_id.clone())
            .or_default();
        if msgs.iter().any(|m| m.id == message.id) {
            return Err(StoreError::Conflict(format!(
                "message '{}' already exists",
                message.id
            )));
        }
        msgs.push(message.clone());
        Ok(message)
    }

    async fn get(
        &self,
        channel: &ChannelId,
        id: &MessageId,
    ) -> Result<Option<ChatMessage>, StoreError> {
        Ok(self
            .state
            .read()
            .messages
            .get(channel)
            .and_then(|msgs| msgs.iter().find(|m| &m.id == id))
            .cloned())
    }

    async fn update_content(
        &self,
        channel: &ChannelId,
        id: &MessageId,
        content: String,
        at: i64,
    ) -> Result<ChatMessage, StoreError> {
        self.with_message(channel, id, |m| {
            m.content = content;
            m.updated_at = at;
            m.clone()
        })
    }

    async fn mark_deleted(
        &self,
        channel: &ChannelId,
        id: &MessageId,
        at: i64,
    ) -> Result<ChatMessage, StoreError> {
        self.with_message(channel, id, |m| {
            m.content.clear();
            m.is_deleted = true;
            m.updated_at = at;
            m.clone()
        })
    }

    async fn remove(&self, channel: &ChannelId, id: &MessageId) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let Some(msgs) = state.messages.get_mut(channel) else {
            return Ok(false);
        };
        let before = msgs.len();
        msgs.retain(|m| &m.id != id);
        Ok(msgs.len() != before)
    }

    async fn set_display_order(
        &self,
        channel: &ChannelId,
        id: &MessageId,
        order: f64,
    ) -> Result<(), StoreError> {
        self.with_message(channel, id, |m| m.display_order = order)
    }

    async fn list_page(
        &self,
        channel: &ChannelId,
        viewer: &UserId,
        before: Option<&ListPosition>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let state = self.state.read();
        let mut visible: Vec<ChatMessage> = state
            .messages
            .get(channel)
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| m.is_visible_to(viewer))
                    .filter(|m| before.is_none_or(|b| m.position().compare(b).is_lt()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        visible.sort_by(|a, b| a.position().compare(&b.position()));
        let skip = visible.len().saturating_sub(limit);
        Ok(visible.split_off(skip))
    }

    async fn list_all(&self, channel: &ChannelId) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self
            .state
            .read()
            .messages
            .get(channel)
            .cloned()
            .unwrap_or_default())
    }

    async fn apply_orders(
        &self,
        channel: &ChannelId,
        updates: &[(MessageId, f64)],
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let Some(msgs) = state.messages.get_mut(channel) else {
            return Err(StoreError::not_found("channel", channel.as_str()));
        };
        let orders: HashMap<&MessageId, f64> = updates.iter().map(|(id, o)| (id, *o)).collect();
        for m in msgs.iter_mut() {
            if let Some(order) = orders.get(&m.id) {
                m.display_order = *order;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BotSelector for MemoryBackend {
    async fn selected_bot(&self, channel: &ChannelId) -> Result<Option<UserId>, StoreError> {
        Ok(self
            .state
            .read()
            .channels
            .get(channel)
            .filter(|c| c.bot_feature_enabled)
            .and_then(|c| c.bot_id.clone()))
    }
}

#[async_trait]
impl UnreadTracker for MemoryBackend {
    async fn first_unread(
        &self,
        user: &UserId,
        channel: &ChannelId,
    ) -> Result<Option<MessageId>, StoreError> {
        let state = self.state.read();
        let marker = state
            .read_markers
            .get(&(user.clone(), channel.clone()))
            .copied()
            .unwrap_or(i64::MIN);
        Ok(state.messages.get(channel).and_then(|msgs| {
            msgs.iter()
                .filter(|m| !m.is_deleted && m.created_at > marker && m.is_visible_to(user))
                .min_by(|a, b| a.display_order.total_cmp(&b.display_order))
                .map(|m| m.id.clone())
        }))
    }

    async fn mark_read(
        &self,
        user: &UserId,
        channel: &ChannelId,
        at: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let marker = state
            .read_markers
            .entry((user.clone(), channel.clone()))
            .or_insert(at);
        *marker = (*marker).max(at);
        Ok(())
    }
}
