//! Channel handlers: enter, list, membersCount, member.list.online.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parlor_core::ChannelId;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::instrument;

use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::handlers::{parse_params, require_string_param};
use crate::rpc::registry::MethodHandler;

/// Point the calling connection at a channel.
pub struct EnterChannelHandler;

#[async_trait]
impl MethodHandler for EnterChannelHandler {
    #[instrument(skip(self, ctx), fields(method = "channel.enter"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let channel = ChannelId::from(require_string_param(params.as_ref(), "channelId")?);
        let entry = ctx
            .gateway
            .enter_channel(&ctx.connection, &channel)
            .await?;

        let mut data = json!({
            "channelId": entry.channel.id,
            "members": entry.members,
        });
        if let Some(first) = entry.first_unread_id {
            data["firstUnreadId"] = json!(first);
        }
        Ok(data)
    }
}

/// Channels the caller can read, with live presence counts.
pub struct ListChannelsHandler;

#[async_trait]
impl MethodHandler for ListChannelsHandler {
    #[instrument(skip(self, ctx), fields(method = "channel.list"))]
    async fn handle(&self, _params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let user = ctx.user_id()?;
        let presence = ctx.gateway.presence();
        let channels: Vec<Value> = ctx
            .gateway
            .collaborators()
            .channels
            .channels_for(user)
            .await?
            .into_iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "worldId": c.world_id,
                    "name": c.name,
                    "onlineCount": presence.count(&c.id),
                })
            })
            .collect();
        Ok(json!({ "channels": channels }))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MembersCountParams {
    channel_ids: Vec<ChannelId>,
}

/// Online counts for several channels at once.
pub struct MembersCountHandler;

#[async_trait]
impl MethodHandler for MembersCountHandler {
    #[instrument(skip(self, ctx), fields(method = "channel.members_count"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let MembersCountParams { channel_ids } = parse_params(params)?;
        let user = ctx.user_id()?;
        let permissions = &ctx.gateway.collaborators().permissions;

        // Unreadable channels are left out rather than reported as errors
        let mut counts = BTreeMap::new();
        for id in channel_ids {
            if permissions.can_read(user, &id).await? {
                let _ = counts.insert(id.to_string(), ctx.gateway.presence().count(&id));
            }
        }
        Ok(json!({ "counts": counts }))
    }
}

/// Presence snapshot of one channel.
pub struct OnlineMembersHandler;

#[async_trait]
impl MethodHandler for OnlineMembersHandler {
    #[instrument(skip(self, ctx), fields(method = "channel.member.list.online"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let channel = ChannelId::from(require_string_param(params.as_ref(), "channelId")?);
        let user = ctx.user_id()?;
        let _ = ctx.gateway.readable_channel(user, &channel).await?;
        let members = ctx
            .gateway
            .presence()
            .snapshot(&channel, ctx.gateway.registry());
        Ok(json!({ "members": members }))
    }
}
