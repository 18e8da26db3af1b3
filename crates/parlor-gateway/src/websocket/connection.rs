//! One live client connection and its mutable metadata.
//!
//! Every frame bound for the socket goes through a bounded `mpsc` channel
//! drained by a single writer task, so concurrent broadcasters can never
//! interleave partial frames. Metadata (`ConnectionInfo`) sits behind the
//! connection's own lock; the identity is bound once and read lock-free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use parlor_core::clock::monotonic_millis;
use parlor_core::{ChannelId, ConnectionId, UserId, WorldId};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::bot_relay::{HiddenDicePending, MessageContext};
use crate::model::Identity;
use crate::typing::TypingSnapshot;

/// Mutable per-connection state.
#[derive(Clone, Debug, Default)]
pub struct ConnectionInfo {
    /// Last application-level ping (monotonic ms).
    pub last_ping: u64,
    /// Last inbound frame of any kind (monotonic ms).
    pub last_alive: u64,
    /// Accepted client-reported round trip.
    pub latency_ms: Option<u32>,
    /// Channel this connection has entered.
    pub channel_id: Option<ChannelId>,
    /// World of the entered channel.
    pub world_id: Option<WorldId>,
    /// Client is in the foreground.
    pub focused: bool,
    /// Typing sub-state.
    pub typing: TypingSnapshot,
    /// Bot only: last message context relayed per channel.
    pub bot_contexts: HashMap<ChannelId, MessageContext>,
    /// Bot only: hidden-roll reply correlation per channel.
    pub hidden_dice: HashMap<ChannelId, HiddenDicePending>,
}

impl ConnectionInfo {
    /// `max(lastAlive, lastPing)`: the instant this connection last proved
    /// it was alive.
    pub fn liveness(&self) -> u64 {
        self.last_alive.max(self.last_ping)
    }
}

/// A connected `WebSocket` client.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Send channel to the connection's writer task.
    tx: mpsc::Sender<Arc<String>>,
    /// Bound by a successful `identify`.
    identity: OnceLock<Identity>,
    /// Mutable metadata.
    info: Mutex<ConnectionInfo>,
    /// Cancelled to close the transport.
    closed: CancellationToken,
    /// Set once teardown has run.
    torn_down: AtomicBool,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Count of messages dropped due to a full or closed channel.
    pub dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Create a new, unidentified connection.
    pub fn new(tx: mpsc::Sender<Arc<String>>) -> Self {
        let now = monotonic_millis();
        Self {
            id: ConnectionId::new(),
            tx,
            identity: OnceLock::new(),
            info: Mutex::new(ConnectionInfo {
                last_ping: now,
                last_alive: now,
                focused: true,
                ..ConnectionInfo::default()
            }),
            closed: CancellationToken::new(),
            torn_down: AtomicBool::new(false),
            connected_at: Instant::now(),
            dropped_messages: AtomicU64::new(0),
        }
    }

    // ── Identity ────────────────────────────────────────────────────

    /// Bind the identity. Returns `false` if one was already bound.
    pub fn bind_identity(&self, identity: Identity) -> bool {
        self.identity.set(identity).is_ok()
    }

    /// The bound identity, if `identify` has succeeded.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.get()
    }

    /// The bound user, if any.
    pub fn user_id(&self) -> Option<&UserId> {
        self.identity.get().map(|i| &i.user_id)
    }

    /// Whether the bound identity is a bot.
    pub fn is_bot(&self) -> bool {
        self.identity.get().is_some_and(|i| i.is_bot)
    }

    // ── Metadata ────────────────────────────────────────────────────

    /// Run `f` with exclusive access to the metadata.
    ///
    /// Keep `f` short and never await or take another connection's lock
    /// inside it.
    pub fn with_info<T>(&self, f: impl FnOnce(&mut ConnectionInfo) -> T) -> T {
        f(&mut self.info.lock())
    }

    /// A copy of the current metadata.
    pub fn snapshot(&self) -> ConnectionInfo {
        self.info.lock().clone()
    }

    /// Entered channel, if any.
    pub fn channel_id(&self) -> Option<ChannelId> {
        self.info.lock().channel_id.clone()
    }

    /// Whether this connection has entered `channel`.
    pub fn is_in_channel(&self, channel: &ChannelId) -> bool {
        self.info.lock().channel_id.as_ref() == Some(channel)
    }

    /// `max(lastAlive, lastPing)`.
    pub fn liveness(&self) -> u64 {
        self.info.lock().liveness()
    }

    /// Record inbound activity now.
    pub fn mark_alive(&self) {
        self.mark_alive_at(monotonic_millis());
    }

    /// Record inbound activity at `now` (monotonic ms).
    pub fn mark_alive_at(&self, now: u64) {
        let mut info = self.info.lock();
        info.last_alive = info.last_alive.max(now);
    }

    // ── Outbound ────────────────────────────────────────────────────

    /// Queue a text frame for the writer task.
    ///
    /// Returns `false` if the channel is full or closed, and increments
    /// the dropped message counter.
    pub fn send(&self, message: Arc<String>) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize `value` and queue it.
    pub fn send_json<T: Serialize>(&self, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.send(Arc::new(json)),
            Err(_) => false,
        }
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Ask the session to close the transport. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is asked to close.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// Claim the right to tear this connection down.
    ///
    /// Returns `true` exactly once.
    pub fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("user_id", &self.user_id())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
