//! # parlor-gateway
//!
//! Realtime gateway and message-broadcast core of the parlor chat server.
//!
//! - `WebSocket` sessions: identify, app-level ping, latency probes, API dispatch
//! - [`websocket::registry::ConnectionRegistry`]: user → live connections (multi-device),
//!   per-user cap and single-session bots
//! - [`presence::ChannelPresenceIndex`]: who has entered which channel
//! - [`websocket::heartbeat::HealthMonitor`]: outbound pings and the idle sweep
//! - [`websocket::broadcast::EventBroadcaster`]: channel / targeted / excluding / bot fan-out
//! - [`ordering::MessageOrderingEngine`]: fractional display order, typing-aware
//!   placement, drag-and-drop reorder with rebalance
//! - [`typing::TypingPreviewCoordinator`]: typing state machine with throttling
//! - [`bot_relay`]: hidden-roll routing and bot reply correlation
//!
//! All state lives in a [`gateway::Gateway`] value with an explicit
//! start/stop lifecycle; persistence, permissions and identity are consumed
//! through the traits in [`backend`].

#![deny(unsafe_code)]

pub mod backend;
pub mod bot_relay;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod model;
pub mod ordering;
pub mod presence;
pub mod rpc;
pub mod server;
pub mod shutdown;
pub mod typing;
pub mod websocket;

#[cfg(test)]
pub(crate) mod test_support;
