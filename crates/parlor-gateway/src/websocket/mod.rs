//! `WebSocket` transport: connection state, registry, frame dispatch,
//! heartbeat and fan-out.

pub mod broadcast;
pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod registry;
pub mod session;
