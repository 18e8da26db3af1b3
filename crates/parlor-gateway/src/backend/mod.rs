//! Narrow interfaces to the systems the gateway does not own: identity,
//! channel directory, permissions, message persistence, bot selection and
//! unread tracking.
//!
//! Handlers mutate persisted state through these traits *before* asking the
//! broadcaster to fan out, so late readers and live recipients converge on
//! the same value.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use parlor_core::{ChannelId, MessageId, StoreError, UserId};

use crate::model::{ChannelRecord, ChatMessage, ListPosition, UserProfile};

pub use memory::MemoryBackend;

/// Resolves connection credentials to users.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Look up the user behind `credential`; `None` if it is not valid.
    async fn resolve(&self, credential: &str) -> Result<Option<UserProfile>, StoreError>;
}

/// Channel metadata lookups.
#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    /// Fetch one channel.
    async fn channel(&self, id: &ChannelId) -> Result<Option<ChannelRecord>, StoreError>;
    /// Channels `user` is able to read.
    async fn channels_for(&self, user: &UserId) -> Result<Vec<ChannelRecord>, StoreError>;
}

/// Channel-level authorization.
#[async_trait]
pub trait PermissionService: Send + Sync {
    /// May `user` see the channel and its messages?
    async fn can_read(&self, user: &UserId, channel: &ChannelId) -> Result<bool, StoreError>;
    /// May `user` post in the channel?
    async fn can_write(&self, user: &UserId, channel: &ChannelId) -> Result<bool, StoreError>;
    /// Does `user` moderate the channel?
    async fn is_channel_admin(&self, user: &UserId, channel: &ChannelId)
    -> Result<bool, StoreError>;
}

/// Message persistence.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message.
    async fn insert(&self, message: ChatMessage) -> Result<ChatMessage, StoreError>;
    /// Fetch a message by ID within a channel.
    async fn get(&self, channel: &ChannelId, id: &MessageId)
    -> Result<Option<ChatMessage>, StoreError>;
    /// Replace a message body.
    async fn update_content(
        &self,
        channel: &ChannelId,
        id: &MessageId,
        content: String,
        at: i64,
    ) -> Result<ChatMessage, StoreError>;
    /// Retract a message: clear its body and flag it deleted.
    async fn mark_deleted(
        &self,
        channel: &ChannelId,
        id: &MessageId,
        at: i64,
    ) -> Result<ChatMessage, StoreError>;
    /// Remove a message outright. Returns whether it existed.
    async fn remove(&self, channel: &ChannelId, id: &MessageId) -> Result<bool, StoreError>;
    /// Set one message's display order.
    async fn set_display_order(
        &self,
        channel: &ChannelId,
        id: &MessageId,
        order: f64,
    ) -> Result<(), StoreError>;
    /// Up to `limit` messages visible to `viewer` positioned strictly before
    /// `before`, ascending in visual order (the newest page first).
    async fn list_page(
        &self,
        channel: &ChannelId,
        viewer: &UserId,
        before: Option<&ListPosition>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError>;
    /// Every message in the channel, unfiltered.
    async fn list_all(&self, channel: &ChannelId) -> Result<Vec<ChatMessage>, StoreError>;
    /// Write many display orders at once.
    async fn apply_orders(
        &self,
        channel: &ChannelId,
        updates: &[(MessageId, f64)],
    ) -> Result<(), StoreError>;
}

/// Picks the bot that serves a channel.
#[async_trait]
pub trait BotSelector: Send + Sync {
    /// The bot user selected for `channel`, if any.
    async fn selected_bot(&self, channel: &ChannelId) -> Result<Option<UserId>, StoreError>;
}

/// Read markers.
#[async_trait]
pub trait UnreadTracker: Send + Sync {
    /// First message in `channel` that `user` has not read.
    async fn first_unread(
        &self,
        user: &UserId,
        channel: &ChannelId,
    ) -> Result<Option<MessageId>, StoreError>;
    /// Record that `user` has read everything in `channel` up to `at`.
    async fn mark_read(&self, user: &UserId, channel: &ChannelId, at: i64)
    -> Result<(), StoreError>;
}

/// Every collaborator the gateway consumes, bundled for injection.
#[derive(Clone)]
pub struct Collaborators {
    /// Credential resolution.
    pub identity: Arc<dyn IdentityResolver>,
    /// Channel metadata.
    pub channels: Arc<dyn ChannelDirectory>,
    /// Authorization.
    pub permissions: Arc<dyn PermissionService>,
    /// Message persistence.
    pub messages: Arc<dyn MessageStore>,
    /// Bot selection.
    pub bots: Arc<dyn BotSelector>,
    /// Read markers.
    pub unread: Arc<dyn UnreadTracker>,
}

impl Collaborators {
    /// Use a single backend for every collaborator.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: IdentityResolver
            + ChannelDirectory
            + PermissionService
            + MessageStore
            + BotSelector
            + UnreadTracker
            + 'static,
    {
        Self {
            identity: backend.clone(),
            channels: backend.clone(),
            permissions: backend.clone(),
            messages: backend.clone(),
            bots: backend.clone(),
            unread: backend,
        }
    }
}
