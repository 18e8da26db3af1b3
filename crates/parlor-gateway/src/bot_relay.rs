//! Bot relay: hidden-roll routing, reply correlation and server→bot
//! requests keyed by `echo`.
//!
//! Exactly one live bot session per channel receives relayed message
//! context. When the relayed message is a hidden roll, the bot connection
//! remembers who rolled so its next replies in that channel can be
//! whispered back to the roller.

use dashmap::DashMap;
use parlor_core::{ChannelId, ConnectionId, MessageId, UserId};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::websocket::connection::ClientConnection;

/// Bot replies whispered to a hidden roller before correlation ends.
pub const HIDDEN_DICE_REPLY_LIMIT: u32 = 2;

/// Command prefixes that introduce a dice command.
const COMMAND_PREFIXES: [char; 4] = ['.', '。', '/', '!'];

/// Context forwarded with a relayed message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContext {
    /// Channel of the message.
    pub channel_id: ChannelId,
    /// Author.
    pub sender_id: UserId,
    /// Relayed message.
    pub message_id: MessageId,
    /// Whether the message is a hidden roll.
    pub is_hidden_dice: bool,
}

/// Pending hidden-roll correlation on a bot connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HiddenDicePending {
    /// Who rolled.
    pub target: UserId,
    /// Bot messages already whispered to `target`.
    pub count: u32,
}

/// Where a message goes, given the hidden-roll policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HiddenRollRoute {
    /// Ordinary message.
    NotHidden,
    /// Hidden roll answered by the server itself: visible to the sender only.
    WhisperToSelf,
    /// Hidden roll stored as a whisper to the sender and relayed to the bot.
    RelayToBot,
}

/// Whether `content` is a hidden-roll command (`.rh`, `。rh`, `/rh`, `!rh`,
/// case-insensitive).
pub fn is_hidden_roll(content: &str) -> bool {
    let mut chars = content.trim_start().chars();
    let Some(prefix) = chars.next() else {
        return false;
    };
    if !COMMAND_PREFIXES.contains(&prefix) {
        return false;
    }
    let rest: String = chars.take(2).collect();
    rest.eq_ignore_ascii_case("rh")
}

/// Route a message through the hidden-roll policy table.
///
/// | built-in dice | bot feature | bot online | hidden | route |
/// |---|---|---|---|---|
/// | on  | any | any | yes | `WhisperToSelf` |
/// | off | on  | yes | yes | `RelayToBot` |
/// | off | on  | no  | yes | `WhisperToSelf` |
/// | off | off | any | yes | `WhisperToSelf` |
/// | any | any | any | no  | `NotHidden` |
pub fn hidden_roll_route(
    built_in_dice_enabled: bool,
    bot_feature_enabled: bool,
    bot_online: bool,
    content: &str,
) -> HiddenRollRoute {
    if !is_hidden_roll(content) {
        HiddenRollRoute::NotHidden
    } else if !built_in_dice_enabled && bot_feature_enabled && bot_online {
        HiddenRollRoute::RelayToBot
    } else {
        HiddenRollRoute::WhisperToSelf
    }
}

/// Remember the context relayed to a bot connection, seeding hidden-roll
/// correlation when needed.
pub fn record_relay(conn: &ClientConnection, context: &MessageContext) {
    conn.with_info(|info| {
        let _ = info
            .bot_contexts
            .insert(context.channel_id.clone(), context.clone());
        if context.is_hidden_dice {
            let _ = info.hidden_dice.insert(
                context.channel_id.clone(),
                HiddenDicePending {
                    target: context.sender_id.clone(),
                    count: 0,
                },
            );
        }
    });
}

/// Correlate a bot-authored message with a pending hidden roll.
///
/// Returns the user the message must be whispered to, if correlation
/// applies. An explicit whisper target consumes the pending entry and wins.
pub fn correlate_bot_reply(
    conn: &ClientConnection,
    channel: &ChannelId,
    explicit_whisper: bool,
) -> Option<UserId> {
    conn.with_info(|info| {
        if explicit_whisper {
            let _ = info.hidden_dice.remove(channel);
            return None;
        }
        let pending = info.hidden_dice.get_mut(channel)?;
        pending.count += 1;
        let target = pending.target.clone();
        if pending.count >= HIDDEN_DICE_REPLY_LIMIT {
            let _ = info.hidden_dice.remove(channel);
        }
        Some(target)
    })
}

struct PendingBotRequest {
    connection: ConnectionId,
    reply: oneshot::Sender<Value>,
}

/// Outstanding server→bot requests keyed by `echo`.
#[derive(Default)]
pub struct BotRelay {
    pending: DashMap<String, PendingBotRequest>,
}

impl BotRelay {
    /// Create an empty relay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an echo for a request sent to `connection`.
    pub fn register(&self, connection: &ConnectionId) -> (String, oneshot::Receiver<Value>) {
        let echo = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let _ = self.pending.insert(
            echo.clone(),
            PendingBotRequest {
                connection: connection.clone(),
                reply: tx,
            },
        );
        (echo, rx)
    }

    /// Deliver a bot reply. Returns `false` if nothing was waiting on `echo`
    /// or the reply came from a different connection.
    pub fn complete(&self, from: &ConnectionId, echo: &str, data: Value) -> bool {
        let Some((_, pending)) = self
            .pending
            .remove_if(echo, |_, p| &p.connection == from)
        else {
            debug!(echo, "unmatched bot reply");
            return false;
        };
        pending.reply.send(data).is_ok()
    }

    /// Forget a request (timed out or abandoned).
    pub fn cancel(&self, echo: &str) {
        let _ = self.pending.remove(echo);
    }

    /// Fail every request owned by `connection`; waiters see a closed
    /// channel. Returns how many were dropped.
    pub fn fail_connection(&self, connection: &ConnectionId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| &p.connection != connection);
        before - self.pending.len()
    }

    /// Requests still waiting.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
