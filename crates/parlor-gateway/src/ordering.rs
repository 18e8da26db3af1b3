//! Fractional display order for messages.
//!
//! New messages default to `now_ms`. When typing-aware ordering is enabled,
//! concurrent typists are slotted into the current time bucket by the order
//! in which they started composing. Explicit reorders place a message at the
//! midpoint of its neighbors, rebalancing the channel first when the
//! neighbors have collapsed within [`ORDER_EPSILON`].

use std::collections::HashMap;

use parlor_core::{ChannelId, MessageId, StoreError, UserId};

use crate::backend::MessageStore;
use crate::model::ChatMessage;
use crate::typing::TypingRankEntry;

/// Orders closer than this are considered equal.
pub const ORDER_EPSILON: f64 = 1e-3;
/// Nominal distance between neighbors after a rebalance.
pub const ORDER_GAP: f64 = 1000.0;

/// Result of an explicit reorder.
#[derive(Clone, Debug, PartialEq)]
pub struct ReorderOutcome {
    /// Final order of the moved message.
    pub display_order: f64,
    /// Whether anything was written.
    pub changed: bool,
    /// Every message of the channel with its final order, if a rebalance
    /// ran. Includes whispers; filter before showing it to anyone.
    pub rebalanced: Option<Vec<ChatMessage>>,
}

/// Why a reorder could not run.
#[derive(Debug, thiserror::Error)]
pub enum ReorderError {
    /// Neither neighbor was given, or a neighbor is the message itself.
    #[error("{0}")]
    InvalidNeighbors(&'static str),
    /// A named neighbor does not exist in the channel.
    #[error("neighbor message '{0}' not found")]
    NeighborNotFound(MessageId),
    /// Backend failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Computes and applies display orders.
#[derive(Clone, Debug)]
pub struct MessageOrderingEngine {
    typing_order_enabled: bool,
    typing_window_ms: u64,
}

impl MessageOrderingEngine {
    /// Create an engine.
    pub fn new(typing_order_enabled: bool, typing_window_ms: u64) -> Self {
        Self {
            typing_order_enabled,
            typing_window_ms: typing_window_ms.max(1),
        }
    }

    /// Order for a new message from `sender`.
    ///
    /// An explicit order wins. Otherwise typing-aware placement applies when
    /// enabled and at least two users are composing; the fallback is `now`.
    pub fn order_for_new(
        &self,
        explicit: Option<f64>,
        sender: &UserId,
        typists: &[TypingRankEntry],
        now_wall: i64,
    ) -> f64 {
        if let Some(order) = explicit {
            return order;
        }
        if self.typing_order_enabled
            && let Some(order) =
                typing_aware_order(typists, sender, now_wall, self.typing_window_ms)
        {
            return order;
        }
        now_wall as f64
    }

    /// Move `target` between `after_id` (the earlier neighbor) and
    /// `before_id` (the later neighbor). Neighbors `viewer` cannot see are
    /// reported as missing.
    pub async fn reorder(
        &self,
        store: &dyn MessageStore,
        channel: &ChannelId,
        viewer: &UserId,
        target: &ChatMessage,
        before_id: Option<&MessageId>,
        after_id: Option<&MessageId>,
    ) -> Result<ReorderOutcome, ReorderError> {
        if before_id.is_none() && after_id.is_none() {
            return Err(ReorderError::InvalidNeighbors(
                "one of 'beforeId' or 'afterId' is required",
            ));
        }
        if before_id == Some(&target.id) || after_id == Some(&target.id) {
            return Err(ReorderError::InvalidNeighbors(
                "a message cannot be its own neighbor",
            ));
        }

        let mut before = neighbor_order(store, channel, viewer, before_id).await?;
        let mut after = neighbor_order(store, channel, viewer, after_id).await?;
        let mut current = target.display_order;
        let mut rebalanced = None;

        if let (Some(a), Some(b)) = (after, before)
            && (b - a).abs() < ORDER_EPSILON
        {
            let mut messages = store.list_all(channel).await?;
            let plan = rebalance_plan(messages.clone());
            store.apply_orders(channel, &plan).await?;
            before = neighbor_order(store, channel, viewer, before_id).await?;
            after = neighbor_order(store, channel, viewer, after_id).await?;
            if let Some((_, order)) = plan.iter().find(|(id, _)| id == &target.id) {
                current = *order;
            }
            let orders: HashMap<&MessageId, f64> = plan.iter().map(|(id, o)| (id, *o)).collect();
            for m in &mut messages {
                if let Some(order) = orders.get(&m.id) {
                    m.display_order = *order;
                }
            }
            rebalanced = Some(messages);
        }

        let Some(order) = place_between(after, before) else {
            return Err(ReorderError::InvalidNeighbors(
                "one of 'beforeId' or 'afterId' is required",
            ));
        };

        let moved = (order - current).abs() >= ORDER_EPSILON;
        if moved {
            store.set_display_order(channel, &target.id, order).await?;
        }
        let display_order = if moved { order } else { current };
        if let Some(m) = rebalanced
            .iter_mut()
            .flatten()
            .find(|m| m.id == target.id)
        {
            m.display_order = display_order;
        }
        Ok(ReorderOutcome {
            display_order,
            changed: moved || rebalanced.is_some(),
            rebalanced,
        })
    }
}

async fn neighbor_order(
    store: &dyn MessageStore,
    channel: &ChannelId,
    viewer: &UserId,
    id: Option<&MessageId>,
) -> Result<Option<f64>, ReorderError> {
    let Some(id) = id else {
        return Ok(None);
    };
    match store.get(channel, id).await? {
        Some(m) if m.is_visible_to(viewer) => Ok(Some(m.display_order)),
        _ => Err(ReorderError::NeighborNotFound(id.clone())),
    }
}

/// Target order given the earlier (`after`) and later (`before`) neighbor.
pub fn place_between(after: Option<f64>, before: Option<f64>) -> Option<f64> {
    match (after, before) {
        (Some(a), Some(b)) => Some(a + (b - a) / 2.0),
        (None, Some(b)) => Some(b - ORDER_GAP / 2.0),
        (Some(a), None) => Some(a + ORDER_GAP / 2.0),
        (None, None) => None,
    }
}

/// Evenly respace every message of a channel, keeping its current visual
/// order (`display_order`, then `created_at`, then ID).
///
/// The first message keeps its order; the rest follow at
/// `max(span / (n - 1), ORDER_GAP)` intervals.
pub fn rebalance_plan(mut messages: Vec<ChatMessage>) -> Vec<(MessageId, f64)> {
    messages.sort_by(|a, b| a.position().compare(&b.position()));
    let (Some(first), Some(last)) = (messages.first(), messages.last()) else {
        return Vec::new();
    };
    let start = first.display_order;
    let steps = messages.len().saturating_sub(1).max(1) as f64;
    let step = ((last.display_order - start) / steps).max(ORDER_GAP);
    messages
        .into_iter()
        .enumerate()
        .map(|(i, m)| (m.id, start + step * i as f64))
        .collect()
}

/// Slot `sender` into the current time bucket by composition rank.
///
/// `ranked` must already be sorted (see
/// [`TypingPreviewCoordinator::ranked_typists`](crate::typing::TypingPreviewCoordinator::ranked_typists));
/// the sender is appended when absent. Returns `None` when fewer than two
/// users are ranked.
pub fn typing_aware_order(
    ranked: &[TypingRankEntry],
    sender: &UserId,
    now_wall: i64,
    window_ms: u64,
) -> Option<f64> {
    let present = ranked.iter().position(|e| &e.user_id == sender);
    let count = ranked.len() + usize::from(present.is_none());
    if count < 2 {
        return None;
    }
    let rank = present.unwrap_or(ranked.len());
    let window = window_ms as f64;
    let bucket = (now_wall as f64 / window).floor() * window;
    Some(bucket + window / (count as f64 + 1.0) * (rank as f64 + 1.0))
}
