//! Wire-format frames exchanged over the `WebSocket`.
//!
//! Inbound text frames are one of:
//! - a signal: `{"op": "identify" | "ping" | "latencyProbe", "body": {...}}`
//! - an API call: `{"api": "message.create", "echo": "42", "data": {...}}`
//! - a bot reply to a server-initiated request: `{"echo": "...", "data": ...}`
//!
//! Outbound frames are signal replies (`ready`, `pong`, `latencyResult`),
//! API responses mirroring the caller's `echo`, and events.

use parlor_core::ChannelId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::Identity;

/// Signalling operations handled before any API dispatch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "body", rename_all = "camelCase")]
pub enum Signal {
    /// Bind the connection to a user.
    Identify(IdentifyBody),
    /// Application-level keepalive carrying focus and latency.
    Ping(PingBody),
    /// Round-trip measurement request.
    LatencyProbe(LatencyProbeBody),
}

/// `identify` payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IdentifyBody {
    /// Session credential; empty means guest.
    pub credential: String,
    /// Read-only session.
    pub observer: bool,
}

/// `ping` payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PingBody {
    /// Whether the client is in the foreground.
    pub focused: Option<bool>,
    /// Client-measured round trip in milliseconds.
    pub latency: Option<f64>,
}

/// `latencyProbe` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyProbeBody {
    /// Client-chosen probe ID.
    pub id: String,
    /// Client send time, echoed back.
    pub client_sent_at: f64,
}

/// An API call from a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    /// Operation name (e.g. `message.create`).
    pub api: String,
    /// Correlation token mirrored in the response.
    #[serde(default)]
    pub echo: String,
    /// Operation payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A bot's answer to a server-initiated request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BotReply {
    /// Echo of the server's request.
    pub echo: String,
    /// Reply payload.
    #[serde(default)]
    pub data: Value,
}

/// Any decoded inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    /// Signalling operation.
    Signal(Signal),
    /// API call.
    Api(ApiRequest),
    /// Reply to a server-to-bot request.
    BotReply(BotReply),
}

/// Why an inbound frame could not be decoded.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Not JSON, or a known frame kind with the wrong shape.
    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),
    /// Valid JSON that matches no frame kind.
    #[error("frame has none of 'op', 'api' or 'echo'")]
    Unrecognized,
}

impl InboundFrame {
    /// Decode one text frame.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let mut value: Value = serde_json::from_str(text)?;
        let Some(obj) = value.as_object_mut() else {
            return Err(FrameError::Unrecognized);
        };
        if obj.contains_key("op") {
            // `ping` may arrive without a body
            if !obj.contains_key("body") && obj.get("op").and_then(Value::as_str) == Some("ping") {
                let _ = obj.insert("body".into(), Value::Object(serde_json::Map::new()));
            }
            Ok(Self::Signal(serde_json::from_value(value)?))
        } else if obj.contains_key("api") {
            Ok(Self::Api(serde_json::from_value(value)?))
        } else if obj.contains_key("echo") {
            Ok(Self::BotReply(serde_json::from_value(value)?))
        } else {
            Err(FrameError::Unrecognized)
        }
    }
}

/// Replies to signalling operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "body", rename_all = "camelCase")]
pub enum SignalReply {
    /// Outcome of `identify`.
    Ready(ReadyBody),
    /// Answer to `ping`.
    Pong,
    /// Answer to `latencyProbe`.
    LatencyResult(LatencyResultBody),
}

/// `ready` payload: either the resolved identity or an error message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyBody {
    /// Resolved identity on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Identity>,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

/// `latencyResult` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyResultBody {
    /// Probe ID.
    pub id: String,
    /// Client send time as received.
    pub client_sent_at: f64,
    /// Server wall-clock time, epoch ms.
    pub server_sent_at: i64,
}

impl SignalReply {
    /// Successful `ready`.
    pub fn ready(user: Identity) -> Self {
        Self::Ready(ReadyBody {
            user: Some(user),
            error_msg: None,
        })
    }

    /// Failed `ready`.
    pub fn ready_error(message: impl Into<String>) -> Self {
        Self::Ready(ReadyBody {
            user: None,
            error_msg: Some(message.into()),
        })
    }
}

/// Response to an API call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    /// Caller's correlation token, verbatim.
    pub echo: String,
    /// Whether the call succeeded.
    pub success: bool,
    /// Result payload (present when `success == true`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error payload (present when `success == false`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Structured error inside an `ApiResponse`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code (e.g. `NOT_FOUND`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ApiResponse {
    /// Build a success response.
    pub fn success(echo: impl Into<String>, data: Value) -> Self {
        Self {
            echo: echo.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Build an error response.
    pub fn error(echo: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            echo: echo.into(),
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: code.into(),
                message: message.into(),
                details: None,
            }),
        }
    }
}

/// Event types pushed to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// A message was posted.
    MessageCreated,
    /// A message body changed.
    MessageUpdated,
    /// A message was retracted.
    MessageDeleted,
    /// A message was removed outright.
    MessageRemoved,
    /// Display orders changed.
    MessageReordered,
    /// Someone's typing state changed.
    TypingPreview,
    /// Channel presence changed.
    ChannelPresenceUpdated,
    /// Process-wide notice.
    Notice,
    /// Message context forwarded to a channel's bot.
    MessageRelay,
}

impl EventKind {
    /// Wire name, for logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageCreated => "message-created",
            Self::MessageUpdated => "message-updated",
            Self::MessageDeleted => "message-deleted",
            Self::MessageRemoved => "message-removed",
            Self::MessageReordered => "message-reordered",
            Self::TypingPreview => "typing-preview",
            Self::ChannelPresenceUpdated => "channel-presence-updated",
            Self::Notice => "notice",
            Self::MessageRelay => "message-relay",
        }
    }
}

/// Server-pushed event.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEvent {
    /// Event type.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Dispatch time, epoch ms; stamped by the broadcaster.
    pub timestamp: i64,
    /// Channel the event concerns, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    /// Event payload.
    pub data: Value,
}

impl ServerEvent {
    /// Create an unstamped event.
    pub fn new(kind: EventKind, channel_id: Option<ChannelId>, data: Value) -> Self {
        Self {
            kind,
            timestamp: 0,
            channel_id,
            data,
        }
    }

    /// Create an unstamped channel event.
    pub fn channel(kind: EventKind, channel_id: &ChannelId, data: Value) -> Self {
        Self::new(kind, Some(channel_id.clone()), data)
    }
}

/// Request pushed from the server to a bot, answered by a [`BotReply`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BotRequest {
    /// Operation name.
    pub api: String,
    /// Server-allocated correlation token.
    pub echo: String,
    /// Payload.
    pub data: Value,
}
