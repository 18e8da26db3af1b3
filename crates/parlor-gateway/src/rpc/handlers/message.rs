//! Message handlers: create, update, delete, remove, reorder, typing, list.
//!
//! Every mutation is persisted through the message store first and only
//! then fanned out, so a client that lists after seeing an event always
//! finds the state the event described.

use async_trait::async_trait;
use parlor_core::clock::{monotonic_millis, now_millis};
use parlor_core::{ChannelId, IdentityId, MessageId, UserId};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::bot_relay::{HiddenRollRoute, correlate_bot_reply, hidden_roll_route, is_hidden_roll};
use crate::model::{ChannelRecord, ChatMessage, ListPosition, Tone};
use crate::ordering::ReorderError;
use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::handlers::parse_params;
use crate::rpc::registry::MethodHandler;
use crate::rpc::types::EventKind;
use crate::typing::{TypingPreviewCoordinator, TypingSignal};

/// Default page size of `message.list`.
const DEFAULT_PAGE_SIZE: i64 = 50;
/// Largest page `message.list` serves.
const MAX_PAGE_SIZE: i64 = 100;

/// Resolve `channel` for a caller that is about to write to it.
async fn writable_channel(
    ctx: &RpcContext,
    user: &UserId,
    channel: &ChannelId,
) -> Result<ChannelRecord, RpcError> {
    let record = ctx.gateway.readable_channel(user, channel).await?;
    if !ctx
        .gateway
        .collaborators()
        .permissions
        .can_write(user, channel)
        .await?
    {
        return Err(RpcError::denied("You cannot post in this channel"));
    }
    Ok(record)
}

/// Fetch a message `user` can see. Invisible whispers look missing.
async fn visible_message(
    ctx: &RpcContext,
    user: &UserId,
    channel: &ChannelId,
    id: &MessageId,
) -> Result<ChatMessage, RpcError> {
    ctx.gateway
        .collaborators()
        .messages
        .get(channel, id)
        .await?
        .filter(|m| m.is_visible_to(user))
        .ok_or_else(RpcError::message_not_found)
}

async fn is_admin(ctx: &RpcContext, user: &UserId, channel: &ChannelId) -> Result<bool, RpcError> {
    Ok(ctx
        .gateway
        .collaborators()
        .permissions
        .is_channel_admin(user, channel)
        .await?)
}

fn require_content(content: &str) -> Result<(), RpcError> {
    if content.trim().is_empty() {
        return Err(RpcError::InvalidParams {
            message: "Message content must not be empty".into(),
        });
    }
    Ok(())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateParams {
    channel_id: ChannelId,
    content: String,
    quote_id: Option<MessageId>,
    whisper_to: Option<UserId>,
    display_order: Option<f64>,
    identity_id: Option<IdentityId>,
    #[serde(default)]
    ic_mode: Tone,
}

/// Post a message.
///
/// Human messages pass through the hidden-roll policy and may be relayed to
/// the channel's bot. Bot messages are correlated with a pending hidden
/// roll and never relayed.
pub struct CreateMessageHandler;

#[async_trait]
impl MethodHandler for CreateMessageHandler {
    #[instrument(skip(self, ctx), fields(method = "message.create", channel_id))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let p: CreateParams = parse_params(params)?;
        let _ = tracing::Span::current().record("channel_id", p.channel_id.as_str());
        let identity = ctx.identity()?;
        let sender = identity.user_id.clone();
        let gateway = &ctx.gateway;

        let record = writable_channel(ctx, &sender, &p.channel_id).await?;
        require_content(&p.content)?;
        if p.display_order.is_some_and(|o| !o.is_finite()) {
            return Err(RpcError::InvalidParams {
                message: "displayOrder must be a finite number".into(),
            });
        }
        if let Some(quote) = &p.quote_id {
            let _ = visible_message(ctx, &sender, &p.channel_id, quote).await?;
        }

        let mut whisper_to = p.whisper_to;
        let mut hidden_roll = false;
        // Some(is_hidden_dice) when the message goes to the channel's bot
        let mut relay = None;

        if identity.is_bot {
            if let Some(target) =
                correlate_bot_reply(&ctx.connection, &p.channel_id, whisper_to.is_some())
            {
                debug!(target = %target, "bot reply whispered to hidden roller");
                whisper_to = Some(target);
            }
        } else {
            let bot_online = is_hidden_roll(&p.content)
                && gateway
                    .selected_bot_connection(&p.channel_id)
                    .await?
                    .is_some();
            match hidden_roll_route(
                gateway.channel_dice_enabled(&record),
                record.bot_feature_enabled,
                bot_online,
                &p.content,
            ) {
                HiddenRollRoute::NotHidden => {
                    if whisper_to.is_none() && record.bot_feature_enabled {
                        relay = Some(false);
                    }
                }
                HiddenRollRoute::WhisperToSelf => {
                    whisper_to = Some(sender.clone());
                    hidden_roll = true;
                }
                HiddenRollRoute::RelayToBot => {
                    whisper_to = Some(sender.clone());
                    hidden_roll = true;
                    relay = Some(true);
                }
            }
        }

        let now = now_millis();
        // Rank typists before the sender's own typing state is cleared
        let typists = TypingPreviewCoordinator::ranked_typists(
            &gateway.registry().channel_connections(&p.channel_id),
        );
        let display_order = gateway
            .ordering()
            .order_for_new(p.display_order, &sender, &typists, now);

        let message = ChatMessage {
            id: MessageId::new(),
            channel_id: p.channel_id,
            user_id: sender.clone(),
            content: p.content,
            display_order,
            created_at: now,
            updated_at: now,
            whisper_to,
            quote_id: p.quote_id,
            identity_id: p.identity_id,
            ic_mode: p.ic_mode,
            is_deleted: false,
            is_hidden_roll: hidden_roll,
        };
        let message = gateway.collaborators().messages.insert(message).await?;

        if ctx.connection.is_in_channel(&message.channel_id) {
            let _ = gateway.clear_typing(&ctx.connection, &sender, &message.channel_id);
        }
        let _ = gateway.publish_message(
            EventKind::MessageCreated,
            &message,
            json!({ "message": message }),
        );

        if let Some(is_hidden_dice) = relay {
            match gateway.relay_message(&message, is_hidden_dice).await {
                Ok(delivered) => debug!(delivered, is_hidden_dice, "relayed message to bot"),
                Err(e) => warn!(error = %e, message_id = %message.id, "bot relay failed"),
            }
        }

        Ok(json!({ "message": message }))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateParams {
    channel_id: ChannelId,
    message_id: MessageId,
    content: String,
}

/// Edit a message body. Only the author may edit.
pub struct UpdateMessageHandler;

#[async_trait]
impl MethodHandler for UpdateMessageHandler {
    #[instrument(skip(self, ctx), fields(method = "message.update"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let p: UpdateParams = parse_params(params)?;
        let user = ctx.user_id()?;
        let _ = writable_channel(ctx, user, &p.channel_id).await?;
        require_content(&p.content)?;

        let existing = visible_message(ctx, user, &p.channel_id, &p.message_id).await?;
        if existing.is_deleted {
            return Err(RpcError::message_not_found());
        }
        if &existing.user_id != user {
            return Err(RpcError::denied("Only the author can edit a message"));
        }

        let message = ctx
            .gateway
            .collaborators()
            .messages
            .update_content(&p.channel_id, &p.message_id, p.content, now_millis())
            .await?;
        let _ = ctx.gateway.publish_message(
            EventKind::MessageUpdated,
            &message,
            json!({ "message": message }),
        );
        Ok(json!({ "message": message }))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetParams {
    channel_id: ChannelId,
    message_id: MessageId,
}

/// Retract a message: its body is cleared and it stays as a tombstone.
/// The author or a channel admin may retract.
pub struct DeleteMessageHandler;

#[async_trait]
impl MethodHandler for DeleteMessageHandler {
    #[instrument(skip(self, ctx), fields(method = "message.delete"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let p: TargetParams = parse_params(params)?;
        let user = ctx.user_id()?;
        let _ = ctx.gateway.readable_channel(user, &p.channel_id).await?;

        let existing = visible_message(ctx, user, &p.channel_id, &p.message_id).await?;
        if &existing.user_id != user && !is_admin(ctx, user, &p.channel_id).await? {
            return Err(RpcError::denied("Only the author or an admin can delete"));
        }
        if existing.is_deleted {
            return Ok(json!({ "messageId": existing.id }));
        }

        let message = ctx
            .gateway
            .collaborators()
            .messages
            .mark_deleted(&p.channel_id, &p.message_id, now_millis())
            .await?;
        let _ = ctx.gateway.publish_message(
            EventKind::MessageDeleted,
            &message,
            json!({ "messageId": message.id }),
        );
        Ok(json!({ "messageId": message.id }))
    }
}

/// Remove a message outright. Channel admins only.
pub struct RemoveMessageHandler;

#[async_trait]
impl MethodHandler for RemoveMessageHandler {
    #[instrument(skip(self, ctx), fields(method = "message.remove"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let p: TargetParams = parse_params(params)?;
        let user = ctx.user_id()?;
        let _ = ctx.gateway.readable_channel(user, &p.channel_id).await?;
        if !is_admin(ctx, user, &p.channel_id).await? {
            return Err(RpcError::denied("Only an admin can remove messages"));
        }

        // Captured before removal: the event goes to the same audience
        let existing = visible_message(ctx, user, &p.channel_id, &p.message_id).await?;
        let messages = &ctx.gateway.collaborators().messages;
        if !messages.remove(&p.channel_id, &p.message_id).await? {
            return Err(RpcError::message_not_found());
        }
        let _ = ctx.gateway.publish_message(
            EventKind::MessageRemoved,
            &existing,
            json!({ "messageId": existing.id }),
        );
        Ok(json!({ "messageId": existing.id }))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReorderParams {
    channel_id: ChannelId,
    message_id: MessageId,
    before_id: Option<MessageId>,
    after_id: Option<MessageId>,
}

/// Move a message between two neighbors. The author or an admin may move it.
pub struct ReorderMessageHandler;

#[async_trait]
impl MethodHandler for ReorderMessageHandler {
    #[instrument(skip(self, ctx), fields(method = "message.reorder"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let p: ReorderParams = parse_params(params)?;
        let user = ctx.user_id()?;
        let gateway = &ctx.gateway;
        let _ = gateway.readable_channel(user, &p.channel_id).await?;

        let target = visible_message(ctx, user, &p.channel_id, &p.message_id).await?;
        if &target.user_id != user && !is_admin(ctx, user, &p.channel_id).await? {
            return Err(RpcError::denied("Only the author or an admin can reorder"));
        }

        let outcome = gateway
            .ordering()
            .reorder(
                gateway.collaborators().messages.as_ref(),
                &p.channel_id,
                user,
                &target,
                p.before_id.as_ref(),
                p.after_id.as_ref(),
            )
            .await
            .map_err(|e| match e {
                ReorderError::InvalidNeighbors(message) => RpcError::InvalidParams {
                    message: message.into(),
                },
                ReorderError::NeighborNotFound(_) => RpcError::message_not_found(),
                ReorderError::Store(e) => e.into(),
            })?;

        if outcome.changed {
            match &outcome.rebalanced {
                // Every message moved: the whole channel must resync
                Some(messages) => {
                    let _ = gateway.publish_rebalance(
                        &p.channel_id,
                        &target,
                        outcome.display_order,
                        messages,
                    );
                }
                None => {
                    let data = json!({
                        "messageId": target.id,
                        "displayOrder": outcome.display_order,
                    });
                    let _ = gateway.publish_message(EventKind::MessageReordered, &target, data);
                }
            }
        }

        Ok(json!({
            "messageId": target.id,
            "displayOrder": outcome.display_order,
            "changed": outcome.changed,
            "rebalanced": outcome.rebalanced.is_some(),
        }))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingParams {
    channel_id: ChannelId,
    #[serde(flatten)]
    signal: TypingSignal,
}

/// Update the caller's typing preview.
pub struct TypingHandler;

#[async_trait]
impl MethodHandler for TypingHandler {
    #[instrument(skip(self, ctx), fields(method = "message.typing"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let TypingParams { channel_id, signal } = parse_params(params)?;
        let user = ctx.user_id()?;
        let _ = writable_channel(ctx, user, &channel_id).await?;
        if !ctx.connection.is_in_channel(&channel_id) {
            return Err(RpcError::denied("Enter the channel before typing in it"));
        }

        let outcome =
            ctx.gateway
                .typing()
                .apply(&ctx.connection, signal, monotonic_millis(), now_millis());
        if outcome.broadcast {
            let _ = ctx.gateway.publish_typing(user, &channel_id, &outcome);
        }
        Ok(json!({
            "broadcast": outcome.broadcast,
            "orderKey": outcome.order_key,
        }))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    channel_id: ChannelId,
    before: Option<f64>,
    before_id: Option<MessageId>,
    limit: Option<i64>,
}

/// Page backwards through a channel's history.
///
/// `beforeId` (the oldest message already held) is the exact cursor and
/// wins over `before`, which only pages below a display order.
pub struct ListMessagesHandler;

#[async_trait]
impl MethodHandler for ListMessagesHandler {
    #[instrument(skip(self, ctx), fields(method = "message.list"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let p: ListParams = parse_params(params)?;
        let limit = p.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(RpcError::InvalidParams {
                message: format!("limit must be between 1 and {MAX_PAGE_SIZE}"),
            });
        }
        let limit = usize::try_from(limit).map_err(|e| RpcError::InvalidParams {
            message: e.to_string(),
        })?;

        let user = ctx.user_id()?;
        let _ = ctx.gateway.readable_channel(user, &p.channel_id).await?;
        let cursor = match (&p.before_id, p.before) {
            (Some(id), _) => Some(visible_message(ctx, user, &p.channel_id, id).await?.position()),
            (None, Some(order)) => Some(ListPosition::below_order(order)),
            (None, None) => None,
        };

        // One extra row tells whether an older page exists
        let mut messages = ctx
            .gateway
            .collaborators()
            .messages
            .list_page(&p.channel_id, user, cursor.as_ref(), limit + 1)
            .await?;
        let has_more = messages.len() > limit;
        if has_more {
            let _ = messages.remove(0);
        }
        Ok(json!({ "messages": messages, "hasMore": has_more }))
    }
}
