//! Branded ID newtypes.
//!
//! Users, channels, messages and connections all travel as strings on the
//! wire. Wrapping each in its own type keeps a `ChannelId` from being handed
//! to something that expects a `UserId`.
//!
//! Freshly minted IDs are UUID v7 (time-ordered) so that message IDs sort
//! roughly by creation time.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Prefix for the synthetic user IDs handed to guest connections.
pub const GUEST_ID_PREFIX: &str = "guest-";

fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
            }

            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Identifies a user (human, bot, or guest).
    UserId
}

branded_id! {
    /// Identifies a channel.
    ChannelId
}

branded_id! {
    /// Identifies the world (tenant) a channel belongs to.
    WorldId
}

branded_id! {
    /// Identifies a persisted chat message.
    MessageId
}

branded_id! {
    /// Identifies one live transport connection.
    ConnectionId
}

branded_id! {
    /// Identifies a character identity a user speaks as.
    IdentityId
}

impl UserId {
    /// Mint an ephemeral ID for a guest connection.
    #[must_use]
    pub fn guest() -> Self {
        Self(format!("{GUEST_ID_PREFIX}{}", Uuid::new_v4()))
    }

    /// Whether this ID was minted by [`UserId::guest`].
    pub fn is_guest(&self) -> bool {
        self.0.starts_with(GUEST_ID_PREFIX)
    }
}
