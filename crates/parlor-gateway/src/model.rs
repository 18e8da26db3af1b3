//! Domain records shared by the gateway and its collaborators.

use std::cmp::Ordering;
use std::collections::HashSet;

use parlor_core::{ChannelId, IdentityId, MessageId, UserId, WorldId};
use serde::{Deserialize, Serialize};

/// A user as resolved from a credential.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    /// User ID.
    pub id: UserId,
    /// Display name.
    pub nickname: String,
    /// Avatar URL, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Whether the principal is an automation client.
    #[serde(default)]
    pub is_bot: bool,
}

/// The identity bound to a connection after `identify`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// User ID (synthetic for guests).
    pub user_id: UserId,
    /// Display name.
    pub nickname: String,
    /// Avatar URL, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Automation client.
    pub is_bot: bool,
    /// Anonymous session with a synthetic user ID.
    pub is_guest: bool,
    /// Authenticated but watching only.
    pub is_observer: bool,
}

impl Identity {
    /// Build the identity for a resolved user.
    pub fn from_profile(profile: UserProfile, observer: bool) -> Self {
        Self {
            user_id: profile.id,
            nickname: profile.nickname,
            avatar: profile.avatar,
            is_bot: profile.is_bot,
            is_guest: false,
            is_observer: observer,
        }
    }

    /// Mint an ephemeral guest identity.
    pub fn guest() -> Self {
        Self {
            user_id: UserId::guest(),
            nickname: "Guest".into(),
            avatar: None,
            is_bot: false,
            is_guest: true,
            is_observer: false,
        }
    }

    /// Guests and observers may only call the read-only API subset.
    pub fn is_read_only(&self) -> bool {
        self.is_guest || self.is_observer
    }
}

/// A channel as known to the channel directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRecord {
    /// Channel ID.
    pub id: ChannelId,
    /// Owning world.
    pub world_id: WorldId,
    /// Display name.
    pub name: String,
    /// Built-in dice override; `None` falls back to the gateway default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub built_in_dice_enabled: Option<bool>,
    /// Whether a bot may be attached to this channel.
    #[serde(default)]
    pub bot_feature_enabled: bool,
}

/// In-character or out-of-character speech.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    /// In character.
    #[default]
    Ic,
    /// Out of character.
    Ooc,
}

/// Typing sub-state of a connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypingState {
    /// Typing with the draft shared live.
    Content,
    /// Typing, draft withheld.
    Indicator,
    /// Not typing.
    #[default]
    Silent,
}

impl TypingState {
    /// Whether the user is composing.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Silent)
    }
}

/// A persisted chat message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Message ID.
    pub id: MessageId,
    /// Channel the message belongs to.
    pub channel_id: ChannelId,
    /// Author.
    pub user_id: UserId,
    /// Body; empty once retracted.
    pub content: String,
    /// Fractional render-order key.
    pub display_order: f64,
    /// Creation time, epoch ms.
    pub created_at: i64,
    /// Last edit time, epoch ms.
    pub updated_at: i64,
    /// Whisper recipient; `None` for channel-wide messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whisper_to: Option<UserId>,
    /// Quoted message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_id: Option<MessageId>,
    /// Character identity the author spoke as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<IdentityId>,
    /// IC/OOC flag.
    #[serde(default)]
    pub ic_mode: Tone,
    /// Retracted by its author or an admin.
    #[serde(default)]
    pub is_deleted: bool,
    /// Produced by a hidden roll.
    #[serde(default)]
    pub is_hidden_roll: bool,
}

impl ChatMessage {
    /// Whether `viewer` may see this message.
    pub fn is_visible_to(&self, viewer: &UserId) -> bool {
        match &self.whisper_to {
            None => true,
            Some(target) => target == viewer || &self.user_id == viewer,
        }
    }

    /// The explicit recipient set of a whisper; `None` for channel-wide messages.
    pub fn recipients(&self) -> Option<HashSet<UserId>> {
        self.whisper_to
            .as_ref()
            .map(|target| HashSet::from([self.user_id.clone(), target.clone()]))
    }

    /// Where this message sits in its channel's visual order.
    pub fn position(&self) -> ListPosition {
        ListPosition {
            display_order: self.display_order,
            created_at: self.created_at,
            id: self.id.clone(),
        }
    }
}

/// A message's place in the visual order: display order, then creation
/// time, then ID. Total even when display orders collide.
#[derive(Clone, Debug, PartialEq)]
pub struct ListPosition {
    /// Fractional render-order key.
    pub display_order: f64,
    /// Creation time, epoch ms.
    pub created_at: i64,
    /// Final tie-break.
    pub id: MessageId,
}

impl ListPosition {
    /// A position ahead of every message whose display order is `order` or
    /// greater.
    pub fn below_order(order: f64) -> Self {
        Self {
            display_order: order,
            created_at: i64::MIN,
            id: MessageId::from(""),
        }
    }

    /// Compare two positions in visual order.
    pub fn compare(&self, other: &Self) -> Ordering {
        self.display_order
            .total_cmp(&other.display_order)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// One row of a channel presence snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    /// Present user.
    pub user_id: UserId,
    /// Whether their freshest connection is in the foreground.
    pub focused: bool,
    /// Measured round trip of that connection, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u32>,
}
