//! Realtime gateway tuning: liveness, caps, typing, ordering, bot relay.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Knobs for the realtime gateway. Durations are in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// Live connections one user may hold before the least-recently-alive
    /// one is evicted.
    pub max_connections_per_user: usize,
    /// Outbound ping cadence for human connections.
    pub human_ping_interval_ms: u64,
    /// Outbound ping cadence for bot connections.
    pub bot_ping_interval_ms: u64,
    /// Deadline for writing a ping control frame.
    pub ping_write_timeout_ms: u64,
    /// How often the idle sweep runs.
    pub sweep_interval_ms: u64,
    /// Idle time after which a human connection is closed.
    pub human_idle_timeout_ms: u64,
    /// Idle time after which a bot connection is closed.
    pub bot_idle_timeout_ms: u64,
    /// Largest client-reported latency accepted into presence.
    pub max_accepted_latency_ms: u64,
    /// Window in which an identical typing signal is coalesced.
    pub typing_throttle_ms: u64,
    /// Order concurrent sends by who started typing first.
    pub typing_order_enabled: bool,
    /// Bucket width used by typing-aware ordering.
    pub typing_order_window_ms: u64,
    /// How long a server-to-bot request waits for its reply.
    pub bot_rpc_timeout_ms: u64,
    /// Upper bound on a single API handler.
    pub handler_timeout_ms: u64,
    /// Built-in dice for channels that do not set the flag themselves.
    pub built_in_dice_enabled: bool,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            max_connections_per_user: 8,
            human_ping_interval_ms: 25_000,
            bot_ping_interval_ms: 10_000,
            ping_write_timeout_ms: 5_000,
            sweep_interval_ms: 10_000,
            human_idle_timeout_ms: 120_000,
            bot_idle_timeout_ms: 45_000,
            max_accepted_latency_ms: 60_000,
            typing_throttle_ms: 250,
            typing_order_enabled: false,
            typing_order_window_ms: 1_000,
            bot_rpc_timeout_ms: 10_000,
            handler_timeout_ms: 30_000,
            built_in_dice_enabled: true,
        }
    }
}

impl GatewaySettings {
    /// Ping cadence for a connection of the given kind.
    pub fn ping_interval(&self, is_bot: bool) -> Duration {
        Duration::from_millis(if is_bot {
            self.bot_ping_interval_ms
        } else {
            self.human_ping_interval_ms
        })
    }

    /// Idle threshold for a connection of the given kind, in milliseconds.
    pub fn idle_timeout_ms(&self, is_bot: bool) -> u64 {
        if is_bot {
            self.bot_idle_timeout_ms
        } else {
            self.human_idle_timeout_ms
        }
    }

    /// Ping write deadline.
    pub fn ping_write_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_write_timeout_ms)
    }

    /// Idle sweep period.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Bot request deadline.
    pub fn bot_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.bot_rpc_timeout_ms)
    }

    /// API handler deadline.
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}
