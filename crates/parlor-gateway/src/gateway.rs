//! The gateway: every piece of realtime state plus the operations that
//! touch more than one of them.
//!
//! A [`Gateway`] is constructed explicitly and owns the connection registry,
//! the presence index, the broadcaster, the ordering engine, the typing
//! coordinator, the bot relay and the API method registry. `start` spawns
//! the idle sweep; `stop` cancels it and closes every connection.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use metrics::counter;
use parking_lot::Mutex;
use parlor_core::clock::{monotonic_millis, now_millis};
use parlor_core::{ChannelId, MessageId, StoreError, UserId};
use parlor_settings::GatewaySettings;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::Collaborators;
use crate::bot_relay::{BotRelay, MessageContext};
use crate::health::{self, HealthResponse};
use crate::metrics::WS_EVICTIONS_TOTAL;
use crate::model::{ChannelRecord, ChatMessage, Identity, PresenceEntry};
use crate::ordering::MessageOrderingEngine;
use crate::presence::ChannelPresenceIndex;
use crate::rpc::context::RpcContext;
use crate::rpc::errors::{self, RpcError};
use crate::rpc::handlers;
use crate::rpc::registry::MethodRegistry;
use crate::rpc::types::{
    ApiRequest, ApiResponse, BotReply, BotRequest, EventKind, IdentifyBody, LatencyProbeBody,
    LatencyResultBody, PingBody, ServerEvent, SignalReply,
};
use crate::shutdown::ShutdownCoordinator;
use crate::typing::{
    TypingOutcome, TypingPreviewCoordinator, TypingRoute, TypingSignal, TypingSnapshot,
    preview_payload,
};
use crate::websocket::broadcast::EventBroadcaster;
use crate::websocket::connection::ClientConnection;
use crate::websocket::heartbeat::{HealthMonitor, run_health_sweep};
use crate::websocket::registry::ConnectionRegistry;

/// Why `identify` failed.
#[derive(Debug, Error)]
pub enum IdentifyError {
    /// The connection already has an identity.
    #[error("connection is already identified")]
    AlreadyIdentified,
    /// The credential resolved to no user.
    #[error("invalid credential")]
    InvalidCredential,
    /// The identity backend failed.
    #[error("identity lookup failed: {0}")]
    Backend(#[from] StoreError),
}

impl IdentifyError {
    /// Text for the `ready.errorMsg` field. Backend details stay server-side.
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::AlreadyIdentified => "Already identified",
            Self::InvalidCredential => "Invalid credential",
            Self::Backend(_) => "Identity service unavailable",
        }
    }

    /// Whether the connection should be closed after replying.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::AlreadyIdentified)
    }
}

/// Result of entering a channel.
#[derive(Clone, Debug)]
pub struct ChannelEntry {
    /// The entered channel.
    pub channel: ChannelRecord,
    /// Oldest unread message for the caller, read before the marker advanced.
    pub first_unread_id: Option<MessageId>,
    /// Presence snapshot after entering.
    pub members: Vec<PresenceEntry>,
}

/// Realtime gateway state and lifecycle.
pub struct Gateway {
    settings: GatewaySettings,
    registry: Arc<ConnectionRegistry>,
    presence: ChannelPresenceIndex,
    broadcaster: EventBroadcaster,
    ordering: MessageOrderingEngine,
    typing: TypingPreviewCoordinator,
    bots: BotRelay,
    health: HealthMonitor,
    collaborators: Collaborators,
    methods: MethodRegistry,
    shutdown: ShutdownCoordinator,
    started_at: Instant,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Build a gateway. Nothing is spawned until [`start`](Self::start).
    pub fn new(settings: GatewaySettings, collaborators: Collaborators) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut methods = MethodRegistry::new().with_timeout(settings.handler_timeout());
        handlers::register_all(&mut methods);

        Self {
            presence: ChannelPresenceIndex::new(),
            broadcaster: EventBroadcaster::new(registry.clone()),
            ordering: MessageOrderingEngine::new(
                settings.typing_order_enabled,
                settings.typing_order_window_ms,
            ),
            typing: TypingPreviewCoordinator::new(settings.typing_throttle_ms),
            bots: BotRelay::new(),
            health: HealthMonitor::new(&settings),
            registry,
            collaborators,
            methods,
            shutdown: ShutdownCoordinator::new(),
            started_at: Instant::now(),
            tasks: Mutex::new(Vec::new()),
            settings,
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Spawn the background idle sweep.
    pub fn start(self: &Arc<Self>) {
        let handle = tokio::spawn(run_health_sweep(
            Arc::clone(self),
            self.settings.sweep_interval(),
            self.shutdown.child_token(),
        ));
        self.tasks.lock().push(handle);
        info!(
            sweep_interval_ms = self.settings.sweep_interval_ms,
            "gateway started"
        );
    }

    /// Cancel background tasks and close every connection.
    pub async fn stop(&self) {
        let handles = std::mem::take(&mut *self.tasks.lock());
        self.shutdown.graceful_shutdown(handles, None).await;
        let conns = self.registry.all();
        for conn in &conns {
            self.disconnect(conn, "shutdown");
        }
        info!(closed = conns.len(), "gateway stopped");
    }

    // ── Accessors ───────────────────────────────────────────────────

    /// Gateway tuning.
    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Live connections.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Channel presence.
    pub fn presence(&self) -> &ChannelPresenceIndex {
        &self.presence
    }

    /// Fan-out capability, shared with anything outside the gateway that
    /// needs to notify a channel.
    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.broadcaster
    }

    /// Display-order engine.
    pub fn ordering(&self) -> &MessageOrderingEngine {
        &self.ordering
    }

    /// Typing state machine.
    pub fn typing(&self) -> &TypingPreviewCoordinator {
        &self.typing
    }

    /// Pending server→bot requests.
    pub fn bots(&self) -> &BotRelay {
        &self.bots
    }

    /// Liveness policy.
    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// External collaborators.
    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// API handlers.
    pub fn methods(&self) -> &MethodRegistry {
        &self.methods
    }

    /// Shutdown signal observed by sessions and the sweep.
    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// `/health` body from live counters.
    pub fn health_report(&self) -> HealthResponse {
        health::health_check(
            self.started_at,
            self.registry.connection_count(),
            self.registry.user_count(),
            self.presence.channel_count(),
        )
    }

    // ── Connection lifecycle ────────────────────────────────────────

    /// Bind `conn` to the user behind `body.credential` and register it.
    ///
    /// An empty credential yields a guest. Sessions evicted to make room
    /// (per-user cap, or every previous session of a bot) are torn down
    /// before this returns.
    pub async fn identify(
        &self,
        conn: &Arc<ClientConnection>,
        body: IdentifyBody,
    ) -> Result<Identity, IdentifyError> {
        if conn.identity().is_some() {
            return Err(IdentifyError::AlreadyIdentified);
        }
        let identity = if body.credential.is_empty() {
            Identity::guest()
        } else {
            let profile = self
                .collaborators
                .identity
                .resolve(&body.credential)
                .await?
                .ok_or(IdentifyError::InvalidCredential)?;
            Identity::from_profile(profile, body.observer)
        };
        if !conn.bind_identity(identity.clone()) {
            return Err(IdentifyError::AlreadyIdentified);
        }
        conn.mark_alive();

        let reason = if identity.is_bot { "bot_replaced" } else { "cap" };
        let evicted = self
            .registry
            .insert(conn.clone(), self.settings.max_connections_per_user);
        for old in &evicted {
            info!(
                conn_id = %old.id,
                user_id = %identity.user_id,
                reason,
                "evicting connection"
            );
            counter!(WS_EVICTIONS_TOTAL, "reason" => reason).increment(1);
            self.disconnect(old, reason);
        }

        info!(
            conn_id = %conn.id,
            user_id = %identity.user_id,
            is_bot = identity.is_bot,
            is_guest = identity.is_guest,
            is_observer = identity.is_observer,
            "connection identified"
        );
        Ok(identity)
    }

    /// Tear `conn` down: close the transport, unregister it, stop its
    /// typing preview and drop its presence if no sibling connection still
    /// holds the channel. Safe to call more than once.
    pub fn disconnect(&self, conn: &Arc<ClientConnection>, reason: &str) {
        conn.close();
        if !conn.begin_teardown() {
            return;
        }
        let failed = self.bots.fail_connection(&conn.id);
        if failed > 0 {
            debug!(conn_id = %conn.id, failed, "abandoned pending bot requests");
        }
        let Some(user) = conn.user_id().cloned() else {
            debug!(conn_id = %conn.id, reason, "unidentified connection closed");
            return;
        };
        let _ = self.registry.remove(&user, &conn.id);

        if let Some(channel) = conn.channel_id() {
            let _ = self.clear_typing(conn, &user, &channel);
            let _ = self.leave_presence_if_last(conn, &user, &channel);
        }
        info!(conn_id = %conn.id, user_id = %user, reason, "connection closed");
    }

    /// Evict every connection idle at `now` (monotonic ms). Returns how many
    /// were evicted.
    pub fn sweep_at(&self, now: u64) -> usize {
        let stale = self.health.stale(&self.registry, now);
        for conn in &stale {
            info!(
                conn_id = %conn.id,
                user_id = ?conn.user_id(),
                idle_ms = now.saturating_sub(conn.liveness()),
                reason = "idle",
                "evicting connection"
            );
            counter!(WS_EVICTIONS_TOTAL, "reason" => "idle").increment(1);
            self.disconnect(conn, "idle");
        }
        stale.len()
    }

    // ── Signals ─────────────────────────────────────────────────────

    /// Apply an application-level ping.
    ///
    /// Refreshes liveness, focus and (if plausible) latency, then
    /// rebroadcasts presence for the connection's channel.
    pub fn handle_ping(&self, conn: &ClientConnection, body: &PingBody) -> SignalReply {
        let now = monotonic_millis();
        let latency = body.latency.and_then(|l| self.health.accept_latency(l));
        if let Some(raw) = body.latency
            && latency.is_none()
        {
            debug!(conn_id = %conn.id, latency = raw, "rejected reported latency");
        }
        let channel = conn.with_info(|info| {
            info.last_ping = info.last_ping.max(now);
            info.last_alive = info.last_alive.max(now);
            if let Some(focused) = body.focused {
                info.focused = focused;
            }
            if latency.is_some() {
                info.latency_ms = latency;
            }
            info.channel_id.clone()
        });
        if let (Some(channel), Some(user)) = (channel, conn.user_id())
            && self.presence.contains(&channel, user)
        {
            let _ = self.broadcast_presence(&channel);
        }
        SignalReply::Pong
    }

    /// Answer a latency probe with the server's wall clock.
    pub fn handle_latency_probe(&self, probe: LatencyProbeBody) -> SignalReply {
        SignalReply::LatencyResult(LatencyResultBody {
            id: probe.id,
            client_sent_at: probe.client_sent_at,
            server_sent_at: now_millis(),
        })
    }

    /// Dispatch an API call from `conn`.
    pub async fn dispatch(
        self: &Arc<Self>,
        request: ApiRequest,
        conn: &Arc<ClientConnection>,
    ) -> ApiResponse {
        let ctx = RpcContext::new(Arc::clone(self), Arc::clone(conn));
        self.methods.dispatch(request, &ctx).await
    }

    // ── Channels & presence ─────────────────────────────────────────

    /// Look up `channel` if `user` may read it.
    ///
    /// Missing and unreadable channels produce the same error.
    pub async fn readable_channel(
        &self,
        user: &UserId,
        channel: &ChannelId,
    ) -> Result<ChannelRecord, RpcError> {
        let Some(record) = self.collaborators.channels.channel(channel).await? else {
            return Err(RpcError::channel_not_found());
        };
        if !self.collaborators.permissions.can_read(user, channel).await? {
            debug!(user_id = %user, channel_id = %channel, "read denied");
            return Err(RpcError::channel_not_found());
        }
        Ok(record)
    }

    /// Point `conn` at `channel`, moving its presence from any previously
    /// entered channel.
    pub async fn enter_channel(
        &self,
        conn: &Arc<ClientConnection>,
        channel: &ChannelId,
    ) -> Result<ChannelEntry, RpcError> {
        let identity = conn
            .identity()
            .ok_or_else(|| RpcError::custom(errors::NOT_IDENTIFIED, "Identify first"))?;
        let user = &identity.user_id;
        let record = self.readable_channel(user, channel).await?;

        let previous = conn.channel_id();
        if let Some(old) = previous.as_ref().filter(|old| *old != channel) {
            let _ = self.clear_typing(conn, user, old);
        }
        conn.with_info(|info| {
            info.channel_id = Some(record.id.clone());
            info.world_id = Some(record.world_id.clone());
        });
        if let Some(old) = previous.as_ref().filter(|old| *old != channel) {
            let _ = self.leave_presence_if_last(conn, user, old);
        }

        let _ = self.presence.join(channel, user);
        let _ = self.broadcast_presence(channel);

        let first_unread_id = if identity.is_guest {
            None
        } else {
            let unread = &self.collaborators.unread;
            let first = unread.first_unread(user, channel).await?;
            unread.mark_read(user, channel, now_millis()).await?;
            first
        };

        debug!(conn_id = %conn.id, user_id = %user, channel_id = %channel, "entered channel");
        Ok(ChannelEntry {
            channel: record,
            first_unread_id,
            members: self.presence.snapshot(channel, &self.registry),
        })
    }

    /// Push the current presence snapshot to everyone in `channel`.
    pub fn broadcast_presence(&self, channel: &ChannelId) -> usize {
        let members = self.presence.snapshot(channel, &self.registry);
        self.broadcaster.broadcast_channel(
            channel,
            ServerEvent::channel(
                EventKind::ChannelPresenceUpdated,
                channel,
                json!({ "members": members }),
            ),
        )
    }

    fn leave_presence_if_last(
        &self,
        conn: &ClientConnection,
        user: &UserId,
        channel: &ChannelId,
    ) -> bool {
        if self.registry.user_in_channel(user, channel, Some(&conn.id)) {
            return false;
        }
        if !self.presence.leave(channel, user) {
            return false;
        }
        let _ = self.broadcast_presence(channel);
        true
    }

    // ── Typing ──────────────────────────────────────────────────────

    /// Fan a typing change out: to the whisper target only, or to everyone
    /// in the channel except the typist. An audience the typist turned away
    /// from is sent a `silent` preview first.
    pub fn publish_typing(
        &self,
        user: &UserId,
        channel: &ChannelId,
        outcome: &TypingOutcome,
    ) -> usize {
        let mut delivered = 0;
        if let Some(route) = &outcome.abandoned {
            let stopped = TypingSnapshot {
                updated_at: outcome.snapshot.updated_at,
                ..TypingSnapshot::default()
            };
            delivered += self.send_typing(user, channel, route, preview_payload(user, &stopped));
        }
        let route = match &outcome.route_whisper {
            Some(target) => TypingRoute::Whisper(target.clone()),
            None => TypingRoute::Channel,
        };
        delivered + self.send_typing(user, channel, &route, preview_payload(user, &outcome.snapshot))
    }

    fn send_typing(
        &self,
        user: &UserId,
        channel: &ChannelId,
        route: &TypingRoute,
        data: Value,
    ) -> usize {
        let event = ServerEvent::channel(EventKind::TypingPreview, channel, data);
        match route {
            TypingRoute::Whisper(target) => self.broadcaster.broadcast_channel_to(
                channel,
                &HashSet::from([target.clone()]),
                event,
            ),
            TypingRoute::Channel => self.broadcaster.broadcast_channel_except(
                channel,
                &HashSet::from([user.clone()]),
                event,
            ),
        }
    }

    /// Force `conn` silent, telling peers if it was typing.
    pub fn clear_typing(&self, conn: &ClientConnection, user: &UserId, channel: &ChannelId) -> bool {
        let outcome = self.typing.apply(
            conn,
            TypingSignal::silent(),
            monotonic_millis(),
            now_millis(),
        );
        if outcome.broadcast {
            let _ = self.publish_typing(user, channel, &outcome);
        }
        outcome.broadcast
    }

    // ── Messages ────────────────────────────────────────────────────

    /// Broadcast an event about `message`, honoring whisper visibility.
    pub fn publish_message(&self, kind: EventKind, message: &ChatMessage, data: Value) -> usize {
        let event = ServerEvent::channel(kind, &message.channel_id, data);
        match message.recipients() {
            Some(recipients) => {
                self.broadcaster
                    .broadcast_channel_to(&message.channel_id, &recipients, event)
            }
            None => self.broadcaster.broadcast_channel(&message.channel_id, event),
        }
    }

    /// Announce a rebalance of `channel`. Each viewer hears only about the
    /// messages they can see, and about `moved` only if it is one of them.
    pub fn publish_rebalance(
        &self,
        channel: &ChannelId,
        moved: &ChatMessage,
        display_order: f64,
        rebalanced: &[ChatMessage],
    ) -> usize {
        self.broadcaster
            .broadcast_channel_per_user(channel, |viewer| {
                let visible: Vec<Value> = rebalanced
                    .iter()
                    .filter(|m| m.is_visible_to(viewer))
                    .map(|m| json!({ "id": m.id, "displayOrder": m.display_order }))
                    .collect();
                let mut data = json!({ "rebalanced": visible });
                if moved.is_visible_to(viewer) {
                    data["messageId"] = json!(moved.id);
                    data["displayOrder"] = json!(display_order);
                }
                Some(ServerEvent::channel(EventKind::MessageReordered, channel, data))
            })
    }

    /// Whether the server answers dice commands in this channel itself.
    pub fn channel_dice_enabled(&self, record: &ChannelRecord) -> bool {
        record
            .built_in_dice_enabled
            .unwrap_or(self.settings.built_in_dice_enabled)
    }

    // ── Bots ────────────────────────────────────────────────────────

    /// The live session of the bot selected for `channel`, if any.
    pub async fn selected_bot_connection(
        &self,
        channel: &ChannelId,
    ) -> Result<Option<Arc<ClientConnection>>, StoreError> {
        let bot = self.collaborators.bots.selected_bot(channel).await?;
        Ok(bot.and_then(|b| self.broadcaster.bot_connection(&b)))
    }

    /// Forward `message` to the bot selected for its channel. Returns
    /// whether a bot session received it.
    pub async fn relay_message(
        &self,
        message: &ChatMessage,
        is_hidden_dice: bool,
    ) -> Result<bool, StoreError> {
        let Some(bot) = self
            .collaborators
            .bots
            .selected_bot(&message.channel_id)
            .await?
        else {
            return Ok(false);
        };
        let context = MessageContext {
            channel_id: message.channel_id.clone(),
            sender_id: message.user_id.clone(),
            message_id: message.id.clone(),
            is_hidden_dice,
        };
        let event = ServerEvent::channel(
            EventKind::MessageRelay,
            &message.channel_id,
            json!({ "message": message, "context": context }),
        );
        Ok(self.broadcaster.broadcast_to_bot(&bot, &context, event))
    }

    /// Send a request to the bot selected for `channel` and wait for the
    /// reply carrying the same `echo`.
    pub async fn bot_request(
        &self,
        channel: &ChannelId,
        api: &str,
        data: Value,
    ) -> Result<Value, RpcError> {
        let Some(conn) = self.selected_bot_connection(channel).await? else {
            return Err(RpcError::custom(
                errors::BOT_UNAVAILABLE,
                "No bot is online for this channel",
            ));
        };
        let (echo, reply) = self.bots.register(&conn.id);
        let request = BotRequest {
            api: api.to_owned(),
            echo: echo.clone(),
            data,
        };
        if !conn.send_json(&request) {
            self.bots.cancel(&echo);
            warn!(conn_id = %conn.id, api, "failed to queue bot request");
            return Err(RpcError::custom(
                errors::BOT_UNAVAILABLE,
                "Bot connection is not accepting requests",
            ));
        }
        debug!(conn_id = %conn.id, api, echo, "sent bot request");

        match tokio::time::timeout(self.settings.bot_rpc_timeout(), reply).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_closed)) => Err(RpcError::custom(
                errors::BOT_UNAVAILABLE,
                "Bot disconnected before replying",
            )),
            Err(_elapsed) => {
                self.bots.cancel(&echo);
                warn!(conn_id = %conn.id, api, echo, "bot request timed out");
                Err(RpcError::custom(errors::BOT_TIMEOUT, "Bot did not reply in time"))
            }
        }
    }

    /// Route a bot's reply frame to whoever is waiting on its echo.
    pub fn handle_bot_reply(&self, conn: &ClientConnection, reply: BotReply) -> bool {
        if !conn.is_bot() {
            debug!(conn_id = %conn.id, echo = reply.echo, "reply frame from non-bot ignored");
            return false;
        }
        self.bots.complete(&conn.id, &reply.echo, reply.data)
    }
}
