//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so the server can hand
//! them to its view layer without extra mapping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use murmur_shared::types::{ChannelId, ChannelKind, MemberRole, MessageId, PresenceStatus, UserId};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A known identity with its last published presence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: UserId, display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            display_name: display_name.into(),
            status: PresenceStatus::Offline,
            last_seen: now,
            created_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// One member record of a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelMember {
    pub user_id: UserId,
    pub role: MemberRole,
    pub joined_at: DateTime<Utc>,
}

/// A conversation channel (public, private or direct).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub kind: ChannelKind,
    /// Cleared when the last member leaves.
    pub is_active: bool,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    /// Ordered by join time.
    pub members: Vec<ChannelMember>,
}

impl Channel {
    pub fn has_member(&self, user_id: &UserId) -> bool {
        self.members.iter().any(|m| &m.user_id == user_id)
    }

    pub fn role_of(&self, user_id: &UserId) -> Option<MemberRole> {
        self.members
            .iter()
            .find(|m| &m.user_id == user_id)
            .map(|m| m.role)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message. Content never changes after insert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    pub content: String,
    pub reply_to: Option<MessageId>,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(channel_id: ChannelId, sender_id: UserId, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            channel_id,
            sender_id,
            content: content.into(),
            reply_to: None,
            is_system: false,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// Reactions and read receipts
// ---------------------------------------------------------------------------

/// A single (message, user, emoji) reaction row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reaction {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

/// Reactions of one message grouped by emoji.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionSummary {
    pub emoji: String,
    pub users: Vec<UserId>,
}

impl ReactionSummary {
    pub fn count(&self) -> usize {
        self.users.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadReceipt {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub read_at: DateTime<Utc>,
}
