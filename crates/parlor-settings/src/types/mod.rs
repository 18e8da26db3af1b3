//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a settings
//! file only needs to name the fields it changes.

mod gateway;
mod server;

pub use gateway::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 7777 },
///   "gateway": { "maxConnectionsPerUser": 4 },
///   "logging": { "level": "debug" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParlorSettings {
    /// Network listener settings.
    pub server: ServerSettings,
    /// Realtime gateway tuning.
    pub gateway: GatewaySettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl ParlorSettings {
    /// Reject combinations that would make the gateway misbehave.
    pub fn validate(&self) -> Result<()> {
        let g = &self.gateway;
        if g.max_connections_per_user == 0 {
            return Err(SettingsError::Conflict {
                field: "gateway.maxConnectionsPerUser",
                rule: "must be at least 1",
            });
        }
        if g.human_idle_timeout_ms <= g.human_ping_interval_ms {
            return Err(SettingsError::Conflict {
                field: "gateway.humanIdleTimeoutMs",
                rule: "must exceed gateway.humanPingIntervalMs",
            });
        }
        if g.bot_idle_timeout_ms <= g.bot_ping_interval_ms {
            return Err(SettingsError::Conflict {
                field: "gateway.botIdleTimeoutMs",
                rule: "must exceed gateway.botPingIntervalMs",
            });
        }
        if g.typing_order_window_ms == 0 {
            return Err(SettingsError::Conflict {
                field: "gateway.typingOrderWindowMs",
                rule: "must be positive",
            });
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of the compact human format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
