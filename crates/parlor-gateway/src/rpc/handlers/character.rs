//! Character sheet queries, answered by the channel's bot.

use async_trait::async_trait;
use parlor_core::ChannelId;
use serde_json::{Value, json};
use tracing::instrument;

use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::handlers::{require_param, require_string_param};
use crate::rpc::registry::MethodHandler;

/// Forward `character.<action>` to the bot serving the channel and return
/// whatever it answers.
pub struct QueryCharacterHandler;

#[async_trait]
impl MethodHandler for QueryCharacterHandler {
    #[instrument(skip(self, ctx), fields(method = "character.query", action))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let channel = ChannelId::from(require_string_param(params.as_ref(), "channelId")?);
        let action = require_string_param(params.as_ref(), "action")?;
        if action.is_empty() || !action.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(RpcError::InvalidParams {
                message: format!("Invalid action '{action}'"),
            });
        }
        let _ = tracing::Span::current().record("action", action.as_str());
        let payload = require_param(params.as_ref(), "payload")
            .cloned()
            .unwrap_or(Value::Null);

        let user = ctx.user_id()?;
        let _ = ctx.gateway.readable_channel(user, &channel).await?;

        ctx.gateway
            .bot_request(
                &channel,
                &format!("character.{action}"),
                json!({
                    "channelId": channel,
                    "userId": user,
                    "payload": payload,
                }),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::handlers::test_helpers::make_test_context;
    use crate::rpc::types::BotReply;
    use crate::test_support::connect;
    use std::sync::Arc;

    #[tokio::test]
    async fn rejects_bad_action() {
        let call = make_test_context("alice").await;
        let err = QueryCharacterHandler
            .handle(
                Some(json!({"channelId": "tavern", "action": "get sheet"})),
                &call.ctx,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMS");
    }

    #[tokio::test]
    async fn no_bot_online_is_unavailable() {
        let call = make_test_context("alice").await;
        let err = QueryCharacterHandler
            .handle(
                Some(json!({"channelId": "tavern", "action": "get"})),
                &call.ctx,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "BOT_UNAVAILABLE");
    }

    #[tokio::test]
    async fn unreadable_channel_is_not_found() {
        let call = make_test_context("alice").await;
        let err = QueryCharacterHandler
            .handle(
                Some(json!({"channelId": "vault", "action": "get"})),
                &call.ctx,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn bot_answer_is_returned() {
        let call = make_test_context("alice").await;
        let gateway = Arc::clone(&call.ctx.gateway);
        let (bot, mut bot_rx) = connect(&gateway, "dicebot").await;

        let responder = tokio::spawn(async move {
            let frame = bot_rx.recv().await.unwrap();
            let request: Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(request["api"], "character.get");
            assert_eq!(request["data"]["userId"], "alice");
            assert_eq!(request["data"]["payload"]["name"], "Mira");
            let reply = BotReply {
                echo: request["echo"].as_str().unwrap().to_owned(),
                data: json!({"hp": 12}),
            };
            assert!(gateway.handle_bot_reply(&bot, reply));
        });

        let data = QueryCharacterHandler
            .handle(
                Some(json!({
                    "channelId": "tavern",
                    "action": "get",
                    "payload": {"name": "Mira"},
                })),
                &call.ctx,
            )
            .await
            .unwrap();
        assert_eq!(data, json!({"hp": 12}));
        responder.await.unwrap();
    }
}
