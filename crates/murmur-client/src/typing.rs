//! Who is typing where, as last reported by the server.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use murmur_shared::protocol::TypingSignal;
use murmur_shared::types::{ChannelId, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Typist {
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct TypingRoster {
    channels: HashMap<ChannelId, Vec<Typist>>,
}

impl TypingRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a start; a repeated start only refreshes the timestamp.
    /// Returns `true` when the visible list changed.
    pub fn started(&mut self, signal: TypingSignal, now: DateTime<Utc>) -> bool {
        let typists = self.channels.entry(signal.channel_id).or_default();
        if let Some(existing) = typists.iter_mut().find(|t| t.user_id == signal.user_id) {
            existing.since = now;
            if signal.display_name.is_some() {
                existing.display_name = signal.display_name;
            }
            return false;
        }
        typists.push(Typist {
            user_id: signal.user_id,
            display_name: signal.display_name,
            since: now,
        });
        true
    }

    pub fn stopped(&mut self, channel_id: ChannelId, user_id: UserId) -> bool {
        let Some(typists) = self.channels.get_mut(&channel_id) else {
            return false;
        };
        let before = typists.len();
        typists.retain(|t| t.user_id != user_id);
        let changed = typists.len() != before;
        if typists.is_empty() {
            self.channels.remove(&channel_id);
        }
        changed
    }

    pub fn typing_in(&self, channel_id: ChannelId) -> &[Typist] {
        self.channels
            .get(&channel_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Drop signals older than `max_age` whose stop never arrived.
    /// Returns the channels whose list changed.
    pub fn prune(&mut self, now: DateTime<Utc>, max_age: Duration) -> Vec<ChannelId> {
        let mut changed = Vec::new();
        self.channels.retain(|channel_id, typists| {
            let before = typists.len();
            typists.retain(|t| now - t.since <= max_age);
            if typists.len() != before {
                changed.push(*channel_id);
            }
            !typists.is_empty()
        });
        changed
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }
}
