//! Inbound frame dispatch: decode one text frame and route it to the
//! signalling operations, the API registry or the bot relay.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument, warn};

use super::connection::ClientConnection;
use crate::gateway::Gateway;
use crate::rpc::errors;
use crate::rpc::types::{ApiResponse, InboundFrame, Signal, SignalReply};

/// What to do after handling a frame.
#[derive(Debug, Default)]
pub struct FrameOutcome {
    /// Serialized reply to queue, if any.
    pub reply: Option<String>,
    /// Close the connection once the reply is flushed.
    pub close: bool,
}

impl FrameOutcome {
    fn reply<T: Serialize>(value: &T) -> Self {
        Self {
            reply: serialize(value),
            close: false,
        }
    }

    fn closing<T: Serialize>(value: &T) -> Self {
        Self {
            reply: serialize(value),
            close: true,
        }
    }
}

fn serialize<T: Serialize>(value: &T) -> Option<String> {
    serde_json::to_string(value)
        .inspect_err(|e| tracing::error!(error = %e, "failed to serialize reply"))
        .ok()
}

/// Handle one inbound text frame from `conn`.
#[instrument(skip_all, fields(conn_id = %conn.id, frame))]
pub async fn handle_frame(
    gateway: &Arc<Gateway>,
    conn: &Arc<ClientConnection>,
    text: &str,
) -> FrameOutcome {
    conn.mark_alive();

    let frame = match InboundFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "invalid frame received");
            return FrameOutcome::reply(&ApiResponse::error(
                "",
                errors::INVALID_PARAMS,
                e.to_string(),
            ));
        }
    };

    match frame {
        InboundFrame::Signal(Signal::Identify(body)) => {
            let _ = tracing::Span::current().record("frame", "identify");
            match gateway.identify(conn, body).await {
                Ok(identity) => FrameOutcome::reply(&SignalReply::ready(identity)),
                Err(e) => {
                    warn!(error = %e, "identify failed");
                    let reply = SignalReply::ready_error(e.client_message());
                    if e.is_fatal() {
                        FrameOutcome::closing(&reply)
                    } else {
                        FrameOutcome::reply(&reply)
                    }
                }
            }
        }
        InboundFrame::Signal(Signal::Ping(body)) => {
            let _ = tracing::Span::current().record("frame", "ping");
            FrameOutcome::reply(&gateway.handle_ping(conn, &body))
        }
        InboundFrame::Signal(Signal::LatencyProbe(probe)) => {
            let _ = tracing::Span::current().record("frame", "latencyProbe");
            FrameOutcome::reply(&gateway.handle_latency_probe(probe))
        }
        InboundFrame::Api(request) => {
            let _ = tracing::Span::current().record("frame", request.api.as_str());
            debug!(api = request.api, echo = request.echo, "dispatching API call");
            FrameOutcome::reply(&gateway.dispatch(request, conn).await)
        }
        InboundFrame::BotReply(reply) => {
            let _ = tracing::Span::current().record("frame", "botReply");
            let _ = gateway.handle_bot_reply(conn, reply);
            FrameOutcome::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fake_connection, test_gateway};
    use serde_json::Value;

    fn parse(outcome: &FrameOutcome) -> Value {
        serde_json::from_str(outcome.reply.as_deref().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn garbage_gets_invalid_params_with_empty_echo() {
        let (gateway, _b) = test_gateway();
        let (conn, _rx) = fake_connection();
        let out = handle_frame(&gateway, &conn, "{not json").await;
        let reply = parse(&out);
        assert_eq!(reply["echo"], "");
        assert_eq!(reply["success"], false);
        assert_eq!(reply["error"]["code"], "INVALID_PARAMS");
        assert!(!out.close);

        let out = handle_frame(&gateway, &conn, r#"{"hello": 1}"#).await;
        assert_eq!(parse(&out)["error"]["code"], "INVALID_PARAMS");
    }

    #[tokio::test]
    async fn identify_then_api_call() {
        let (gateway, _b) = test_gateway();
        let (conn, _rx) = fake_connection();

        let before = handle_frame(&gateway, &conn, r#"{"api":"channel.list","echo":"e0"}"#).await;
        let reply = parse(&before);
        assert_eq!(reply["echo"], "e0");
        assert_eq!(reply["error"]["code"], "NOT_IDENTIFIED");

        let out = handle_frame(
            &gateway,
            &conn,
            r#"{"op":"identify","body":{"credential":"t-alice"}}"#,
        )
        .await;
        let ready = parse(&out);
        assert_eq!(ready["op"], "ready");
        assert_eq!(ready["body"]["user"]["userId"], "alice");

        let out = handle_frame(&gateway, &conn, r#"{"api":"channel.list","echo":"e1"}"#).await;
        let reply = parse(&out);
        assert_eq!(reply["echo"], "e1");
        assert_eq!(reply["success"], true);
    }

    #[tokio::test]
    async fn bad_credential_closes() {
        let (gateway, _b) = test_gateway();
        let (conn, _rx) = fake_connection();
        let out = handle_frame(
            &gateway,
            &conn,
            r#"{"op":"identify","body":{"credential":"wrong"}}"#,
        )
        .await;
        assert!(out.close);
        assert_eq!(parse(&out)["body"]["errorMsg"], "Invalid credential");
    }

    #[tokio::test]
    async fn second_identify_is_answered_but_kept_open() {
        let (gateway, _b) = test_gateway();
        let (conn, _rx) = fake_connection();
        let identify = r#"{"op":"identify","body":{"credential":"t-bob"}}"#;
        let _ = handle_frame(&gateway, &conn, identify).await;
        let out = handle_frame(&gateway, &conn, identify).await;
        assert!(!out.close);
        assert_eq!(parse(&out)["body"]["errorMsg"], "Already identified");
    }

    #[tokio::test]
    async fn ping_and_probe_replies() {
        let (gateway, _b) = test_gateway();
        let (conn, _rx) = fake_connection();
        let out = handle_frame(&gateway, &conn, r#"{"op":"ping"}"#).await;
        assert_eq!(parse(&out)["op"], "pong");

        let out = handle_frame(
            &gateway,
            &conn,
            r#"{"op":"latencyProbe","body":{"id":"p","clientSentAt":5}}"#,
        )
        .await;
        let reply = parse(&out);
        assert_eq!(reply["op"], "latencyResult");
        assert_eq!(reply["body"]["id"], "p");
        assert!(reply["body"]["serverSentAt"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn bot_reply_frames_get_no_answer() {
        let (gateway, _b) = test_gateway();
        let (conn, _rx) = fake_connection();
        let out = handle_frame(&gateway, &conn, r#"{"echo":"abc","data":{}}"#).await;
        assert!(out.reply.is_none());
        assert!(!out.close);
    }
}
