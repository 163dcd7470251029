//! Last known status of every user this client has heard about.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use murmur_shared::protocol::StatusChanged;
use murmur_shared::types::{PresenceStatus, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub status: PresenceStatus,
    pub display_name: Option<String>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct PresenceRoster {
    users: HashMap<UserId, PresenceEntry>,
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a change. Returns `false` when the status was already known, or
    /// when the change is older than what is already recorded.
    pub fn apply(&mut self, change: StatusChanged) -> bool {
        if let Some(current) = self.users.get_mut(&change.user_id) {
            if change.last_seen < current.last_seen {
                return false;
            }
            if current.status == change.status {
                current.last_seen = change.last_seen;
                return false;
            }
        }
        let display_name = change
            .display_name
            .or_else(|| self.users.get(&change.user_id).and_then(|e| e.display_name.clone()));
        self.users.insert(
            change.user_id,
            PresenceEntry {
                status: change.status,
                display_name,
                last_seen: change.last_seen,
            },
        );
        true
    }

    /// Users never heard from are treated as offline.
    pub fn status_of(&self, user_id: UserId) -> PresenceStatus {
        self.users
            .get(&user_id)
            .map(|e| e.status)
            .unwrap_or(PresenceStatus::Offline)
    }

    pub fn get(&self, user_id: UserId) -> Option<&PresenceEntry> {
        self.users.get(&user_id)
    }
}
