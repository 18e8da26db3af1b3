//! Channel presence: which users have entered which channel.
//!
//! Membership is stored; the presence *snapshot* (focus and latency per
//! user) is derived on demand from the freshest connection of each member.

use std::cmp::Ordering;
use std::collections::HashSet;

use dashmap::DashMap;
use parlor_core::{ChannelId, UserId};

use crate::model::PresenceEntry;
use crate::websocket::registry::ConnectionRegistry;

/// `ChannelId → {UserId}`.
#[derive(Default)]
pub struct ChannelPresenceIndex {
    channels: DashMap<ChannelId, HashSet<UserId>>,
}

impl ChannelPresenceIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `user` to `channel`. Returns `true` if they were not present.
    pub fn join(&self, channel: &ChannelId, user: &UserId) -> bool {
        self.channels
            .entry(channel.clone())
            .or_default()
            .insert(user.clone())
    }

    /// Remove `user` from `channel`, pruning empty channels.
    ///
    /// Returns `true` if they were present.
    pub fn leave(&self, channel: &ChannelId, user: &UserId) -> bool {
        let mut removed = false;
        let _ = self.channels.remove_if_mut(channel, |_, members| {
            removed = members.remove(user);
            members.is_empty()
        });
        removed
    }

    /// Whether `user` is present in `channel`.
    pub fn contains(&self, channel: &ChannelId, user: &UserId) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|members| members.contains(user))
    }

    /// Present users, unordered.
    pub fn members(&self, channel: &ChannelId) -> Vec<UserId> {
        self.channels
            .get(channel)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of present users.
    pub fn count(&self, channel: &ChannelId) -> usize {
        self.channels.get(channel).map_or(0, |m| m.len())
    }

    /// Channels with at least one present user.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Derive the presence snapshot of `channel`.
    ///
    /// For each present user, the connection in this channel with the most
    /// recent ping supplies focus and latency. Rows are sorted focused
    /// first, then by ascending latency (unknown last), then by user ID.
    pub fn snapshot(&self, channel: &ChannelId, registry: &ConnectionRegistry) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self
            .members(channel)
            .into_iter()
            .filter_map(|user| {
                registry
                    .user_connections(&user)
                    .iter()
                    .map(|c| c.snapshot())
                    .filter(|info| info.channel_id.as_ref() == Some(channel))
                    .max_by_key(|info| info.last_ping)
                    .map(|info| PresenceEntry {
                        user_id: user,
                        focused: info.focused,
                        latency_ms: info.latency_ms,
                    })
            })
            .collect();
        entries.sort_by(compare_presence);
        entries
    }
}

fn compare_presence(a: &PresenceEntry, b: &PresenceEntry) -> Ordering {
    b.focused
        .cmp(&a.focused)
        .then_with(|| match (a.latency_ms, b.latency_ms) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.user_id.cmp(&b.user_id))
}
