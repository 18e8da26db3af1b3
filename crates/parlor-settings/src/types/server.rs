//! Network listener settings.

use serde::{Deserialize, Serialize};

/// Where and how the HTTP/WebSocket listener binds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Largest accepted WebSocket message, in bytes.
    pub max_message_size: usize,
    /// Optional JSON seed for the in-memory backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed_path: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7777,
            max_message_size: 1024 * 1024,
            seed_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_binds_all_interfaces() {
        let s = ServerSettings::default();
        assert_eq!(s.host, "0.0.0.0");
        assert_eq!(s.port, 7777);
        assert_eq!(s.max_message_size, 1_048_576);
        assert!(s.seed_path.is_none());
    }
}
