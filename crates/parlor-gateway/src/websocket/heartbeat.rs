//! Liveness: outbound ping cadence, latency acceptance and the idle sweep.

use std::sync::Arc;
use std::time::Duration;

use parlor_core::clock::monotonic_millis;
use parlor_settings::GatewaySettings;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::connection::ClientConnection;
use super::registry::ConnectionRegistry;
use crate::gateway::Gateway;

/// Idle thresholds and ping cadence, split by human and bot sessions.
#[derive(Clone, Debug)]
pub struct HealthMonitor {
    human_ping: Duration,
    bot_ping: Duration,
    ping_write_timeout: Duration,
    human_idle_ms: u64,
    bot_idle_ms: u64,
    max_latency_ms: u64,
}

impl HealthMonitor {
    /// Build from gateway settings.
    pub fn new(settings: &GatewaySettings) -> Self {
        Self {
            human_ping: settings.ping_interval(false),
            bot_ping: settings.ping_interval(true),
            ping_write_timeout: settings.ping_write_timeout(),
            human_idle_ms: settings.idle_timeout_ms(false),
            bot_idle_ms: settings.idle_timeout_ms(true),
            max_latency_ms: settings.max_accepted_latency_ms,
        }
    }

    /// Interval between outbound pings on a connection.
    pub fn ping_interval(&self, is_bot: bool) -> Duration {
        if is_bot { self.bot_ping } else { self.human_ping }
    }

    /// Deadline for a single ping write.
    pub fn ping_write_timeout(&self) -> Duration {
        self.ping_write_timeout
    }

    /// Idle time after which a connection is evicted.
    pub fn idle_timeout_ms(&self, is_bot: bool) -> u64 {
        if is_bot { self.bot_idle_ms } else { self.human_idle_ms }
    }

    /// Whether `conn` has been silent for longer than its threshold at `now`
    /// (monotonic ms).
    pub fn is_stale(&self, conn: &ClientConnection, now: u64) -> bool {
        now.saturating_sub(conn.liveness()) > self.idle_timeout_ms(conn.is_bot())
    }

    /// Every registered connection that is stale at `now`.
    pub fn stale(&self, registry: &ConnectionRegistry, now: u64) -> Vec<Arc<ClientConnection>> {
        registry
            .all()
            .into_iter()
            .filter(|c| self.is_stale(c, now))
            .collect()
    }

    /// Validate a client-reported round trip.
    ///
    /// Negative, non-finite or implausibly large values are rejected.
    pub fn accept_latency(&self, latency: f64) -> Option<u32> {
        if latency.is_finite() && latency >= 0.0 && latency <= self.max_latency_ms as f64 {
            u32::try_from(latency.round() as u64).ok()
        } else {
            None
        }
    }
}

/// Run the global idle sweep every `interval` until `cancel` fires.
pub async fn run_health_sweep(gateway: Arc<Gateway>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = gateway.sweep_at(monotonic_millis());
                if evicted > 0 {
                    debug!(evicted, "health sweep evicted idle connections");
                }
            }
            () = cancel.cancelled() => {
                debug!("health sweep stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{identified, test_gateway};

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(&GatewaySettings::default())
    }

    #[test]
    fn bots_ping_faster_and_time_out_sooner() {
        let m = monitor();
        assert!(m.ping_interval(true) < m.ping_interval(false));
        assert!(m.idle_timeout_ms(true) < m.idle_timeout_ms(false));
        assert_eq!(m.idle_timeout_ms(false), 120_000);
        assert_eq!(m.idle_timeout_ms(true), 45_000);
    }

    #[test]
    fn staleness_uses_max_of_alive_and_ping() {
        let m = monitor();
        let (conn, _rx) = identified("alice", false);
        conn.with_info(|i| {
            i.last_alive = 1_000;
            i.last_ping = 50_000;
        });
        assert!(!m.is_stale(&conn, 50_000 + 120_000));
        assert!(m.is_stale(&conn, 50_000 + 120_001));
    }

    #[test]
    fn bot_threshold_is_shorter() {
        let m = monitor();
        let (bot, _rx) = identified("dicebot", true);
        bot.with_info(|i| {
            i.last_alive = 0;
            i.last_ping = 0;
        });
        assert!(m.is_stale(&bot, 45_001));
        let (human, _rx2) = identified("alice", false);
        human.with_info(|i| {
            i.last_alive = 0;
            i.last_ping = 0;
        });
        assert!(!m.is_stale(&human, 45_001));
    }

    #[test]
    fn latency_bounds() {
        let m = monitor();
        assert_eq!(m.accept_latency(0.0), Some(0));
        assert_eq!(m.accept_latency(42.4), Some(42));
        assert_eq!(m.accept_latency(60_000.0), Some(60_000));
        assert_eq!(m.accept_latency(-1.0), None);
        assert_eq!(m.accept_latency(60_001.0), None);
        assert_eq!(m.accept_latency(f64::NAN), None);
        assert_eq!(m.accept_latency(f64::INFINITY), None);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_stops_on_cancel() {
        let (gateway, _backend) = test_gateway();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_health_sweep(
            gateway,
            Duration::from_millis(100),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(350)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
