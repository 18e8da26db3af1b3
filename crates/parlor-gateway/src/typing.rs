//! Typing preview state machine.
//!
//! Each connection carries a [`TypingSnapshot`]. Inbound typing signals are
//! applied under the connection's lock and yield a [`TypingOutcome`] telling
//! the caller whether to fan the change out:
//!
//! - an identical active signal inside the throttle window is coalesced;
//! - `silent` always updates local state but is broadcast only when leaving
//!   an active state;
//! - the order key is allocated on the `silent → active` edge and kept while
//!   the user keeps typing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parlor_core::{IdentityId, UserId};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::model::{Tone, TypingState};
use crate::websocket::connection::ClientConnection;

/// Per-connection typing state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TypingSnapshot {
    /// Current state.
    pub state: TypingState,
    /// Draft, shared only in `content` state.
    pub content: String,
    /// Whisper target of the draft.
    pub whisper_to: Option<UserId>,
    /// IC/OOC.
    pub tone: Tone,
    /// Character identity.
    pub identity_id: Option<IdentityId>,
    /// Composition order key; 0 when silent.
    pub order_key: u64,
    /// Last update, epoch ms.
    pub updated_at: i64,
    /// Last time this state was fanned out (monotonic ms).
    pub last_broadcast_at: Option<u64>,
}

/// An inbound typing signal.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TypingSignal {
    /// Requested state.
    pub state: TypingState,
    /// Draft text.
    pub content: String,
    /// Whisper target.
    pub whisper_to: Option<UserId>,
    /// IC/OOC.
    pub tone: Tone,
    /// Character identity.
    pub identity_id: Option<IdentityId>,
}

impl TypingSignal {
    /// The synthetic stop signal sent on a user's behalf.
    pub fn silent() -> Self {
        Self::default()
    }

    fn matches(&self, snap: &TypingSnapshot) -> bool {
        self.state == snap.state
            && self.content == snap.content
            && self.whisper_to == snap.whisper_to
            && self.tone == snap.tone
            && self.identity_id == snap.identity_id
    }
}

/// Result of applying a signal.
#[derive(Clone, Debug, PartialEq)]
pub struct TypingOutcome {
    /// Whether peers must be told.
    pub broadcast: bool,
    /// Current order key (0 when silent).
    pub order_key: u64,
    /// Whisper target to route the preview to; for `silent`, the target of
    /// the state being left.
    pub route_whisper: Option<UserId>,
    /// State after the signal.
    pub snapshot: TypingSnapshot,
    /// Audience of a preview the typist moved away from while still
    /// typing (whisper target changed). It must be told the preview stopped.
    pub abandoned: Option<TypingRoute>,
}

/// Who sees a typing preview.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypingRoute {
    /// Everyone in the channel except the typist.
    Channel,
    /// Only this whisper target.
    Whisper(UserId),
}

impl TypingRoute {
    fn of(whisper_to: Option<UserId>) -> Self {
        whisper_to.map_or(Self::Channel, Self::Whisper)
    }
}

/// One candidate in the typing-aware ordering rank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypingRankEntry {
    /// Typist.
    pub user_id: UserId,
    /// Composition order key.
    pub order_key: u64,
    /// Last update, epoch ms.
    pub updated_at: i64,
}

/// Applies typing signals and allocates order keys.
pub struct TypingPreviewCoordinator {
    throttle_ms: u64,
    order_counter: AtomicU64,
}

impl TypingPreviewCoordinator {
    /// Create a coordinator coalescing identical signals within `throttle_ms`.
    pub fn new(throttle_ms: u64) -> Self {
        Self {
            throttle_ms,
            order_counter: AtomicU64::new(0),
        }
    }

    /// Next order key: strictly increasing, never behind the wall clock.
    pub fn next_order_key(&self, now_wall: i64) -> u64 {
        let floor = u64::try_from(now_wall).unwrap_or(0);
        let prev = self
            .order_counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some(prev.saturating_add(1).max(floor))
            })
            .unwrap_or_else(|prev| prev);
        prev.saturating_add(1).max(floor)
    }

    /// Apply `signal` to `conn`.
    ///
    /// `now_mono` drives the throttle, `now_wall` stamps the snapshot.
    pub fn apply(
        &self,
        conn: &ClientConnection,
        signal: TypingSignal,
        now_mono: u64,
        now_wall: i64,
    ) -> TypingOutcome {
        conn.with_info(|info| {
            let prev = std::mem::take(&mut info.typing);
            let active = signal.state.is_active();

            let broadcast = if active {
                let coalesced = signal.matches(&prev)
                    && prev
                        .last_broadcast_at
                        .is_some_and(|at| now_mono.saturating_sub(at) < self.throttle_ms);
                !coalesced
            } else {
                prev.state.is_active()
            };

            let order_key = if !active {
                0
            } else if prev.state.is_active() && prev.order_key > 0 {
                prev.order_key
            } else {
                self.next_order_key(now_wall)
            };

            let route_whisper = if active {
                signal.whisper_to.clone()
            } else {
                prev.whisper_to.clone()
            };
            let abandoned = (active
                && prev.state.is_active()
                && prev.whisper_to != signal.whisper_to)
                .then(|| TypingRoute::of(prev.whisper_to.clone()));

            let snapshot = if active {
                TypingSnapshot {
                    state: signal.state,
                    content: if signal.state == TypingState::Content {
                        signal.content
                    } else {
                        String::new()
                    },
                    whisper_to: signal.whisper_to,
                    tone: signal.tone,
                    identity_id: signal.identity_id,
                    order_key,
                    updated_at: now_wall,
                    last_broadcast_at: if broadcast {
                        Some(now_mono)
                    } else {
                        prev.last_broadcast_at
                    },
                }
            } else {
                TypingSnapshot {
                    updated_at: now_wall,
                    last_broadcast_at: if broadcast { Some(now_mono) } else { None },
                    ..TypingSnapshot::default()
                }
            };
            info.typing = snapshot.clone();

            TypingOutcome {
                broadcast,
                order_key,
                route_whisper,
                snapshot,
                abandoned,
            }
        })
    }

    /// Rank the active, non-whisper typists among `connections`.
    ///
    /// Keeps the most recently updated snapshot per user and sorts by
    /// `(order_key asc, updated_at desc, user asc)`.
    pub fn ranked_typists(connections: &[Arc<ClientConnection>]) -> Vec<TypingRankEntry> {
        let mut latest: HashMap<UserId, TypingRankEntry> = HashMap::new();
        for conn in connections {
            let Some(user) = conn.user_id() else {
                continue;
            };
            let typing = conn.with_info(|info| info.typing.clone());
            if !typing.state.is_active() || typing.whisper_to.is_some() || typing.order_key == 0 {
                continue;
            }
            let candidate = TypingRankEntry {
                user_id: user.clone(),
                order_key: typing.order_key,
                updated_at: typing.updated_at,
            };
            let _ = latest
                .entry(user.clone())
                .and_modify(|e| {
                    if candidate.updated_at > e.updated_at {
                        *e = candidate.clone();
                    }
                })
                .or_insert(candidate);
        }
        let mut ranked: Vec<TypingRankEntry> = latest.into_values().collect();
        ranked.sort_by(|a, b| {
            a.order_key
                .cmp(&b.order_key)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        ranked
    }
}

/// Payload of a `typing-preview` event.
pub fn preview_payload(user: &UserId, snapshot: &TypingSnapshot) -> Value {
    let mut data = json!({
        "userId": user,
        "state": snapshot.state,
        "tone": snapshot.tone,
        "orderKey": snapshot.order_key,
    });
    if snapshot.state == TypingState::Content {
        data["content"] = json!(snapshot.content);
    }
    if let Some(target) = &snapshot.whisper_to {
        data["whisperTo"] = json!(target);
    }
    if let Some(identity) = &snapshot.identity_id {
        data["identityId"] = json!(identity);
    }
    data
}
