//! API error codes and error type.

use parlor_core::StoreError;

use crate::rpc::types::ErrorBody;

// ── Error code constants ────────────────────────────────────────────

/// Invalid or missing parameters.
pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
/// Unexpected internal error.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
/// No handler registered under that API name.
pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
/// API call before a successful `identify`.
pub const NOT_IDENTIFIED: &str = "NOT_IDENTIFIED";
/// Guest or observer attempted a write.
pub const READ_ONLY: &str = "READ_ONLY";
/// Channel or message absent, or not visible to the caller.
pub const NOT_FOUND: &str = "NOT_FOUND";
/// Caller can see the resource but may not perform this action on it.
pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
/// No live bot serves the channel.
pub const BOT_UNAVAILABLE: &str = "BOT_UNAVAILABLE";
/// The bot did not answer in time.
pub const BOT_TIMEOUT: &str = "BOT_TIMEOUT";

/// Error type returned by API handlers.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Required parameter missing or wrong type.
    #[error("{message}")]
    InvalidParams {
        /// Description of what is wrong.
        message: String,
    },

    /// Resource absent or hidden from the caller.
    #[error("{message}")]
    NotFound {
        /// Human-readable message.
        message: String,
    },

    /// Resource visible but the action is not allowed.
    #[error("{message}")]
    PermissionDenied {
        /// Human-readable message.
        message: String,
    },

    /// Internal server error.
    #[error("{message}")]
    Internal {
        /// Description.
        message: String,
    },

    /// Domain-specific error with arbitrary code.
    #[error("{message}")]
    Custom {
        /// Machine-readable code.
        code: String,
        /// Human-readable message.
        message: String,
        /// Optional structured details.
        details: Option<serde_json::Value>,
    },
}

impl RpcError {
    /// The error every unreadable or missing channel produces, so the two
    /// cannot be told apart.
    pub fn channel_not_found() -> Self {
        Self::NotFound {
            message: "Channel not found".into(),
        }
    }

    /// Missing message (or one in a channel the caller cannot read).
    pub fn message_not_found() -> Self {
        Self::NotFound {
            message: "Message not found".into(),
        }
    }

    /// Shorthand for [`RpcError::PermissionDenied`].
    pub fn denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    /// Shorthand for a [`RpcError::Custom`] without details.
    pub fn custom(code: &str, message: impl Into<String>) -> Self {
        Self::Custom {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Machine-readable error code for this variant.
    pub fn code(&self) -> &str {
        match self {
            Self::InvalidParams { .. } => INVALID_PARAMS,
            Self::NotFound { .. } => NOT_FOUND,
            Self::PermissionDenied { .. } => PERMISSION_DENIED,
            Self::Internal { .. } => INTERNAL_ERROR,
            Self::Custom { code, .. } => code,
        }
    }

    /// Convert to the wire-format error body.
    ///
    /// Internal details (backend messages) are never sent to the client.
    pub fn to_error_body(&self) -> ErrorBody {
        let message = match self {
            Self::Internal { .. } => "Internal error".to_string(),
            other => other.to_string(),
        };
        ErrorBody {
            code: self.code().to_owned(),
            message,
            details: match self {
                Self::Custom { details, .. } => details.clone(),
                _ => None,
            },
        }
    }
}

impl From<StoreError> for RpcError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, .. } => Self::NotFound {
                message: format!("{} not found", capitalize(kind)),
            },
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
