//! Optimistic message timeline for one channel.
//!
//! An outgoing message is shown immediately as [`TimelineEntry::Pending`]
//! under a client-generated temp id. The server answers twice: a
//! `message-delivered` ack to this connection and a `new-message` echo to the
//! whole room. Whichever arrives first confirms the entry in place; the other
//! is absorbed. Neither order nor the loss of one of them can produce a
//! second visible copy.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace};
use uuid::Uuid;

use murmur_shared::protocol::{MessageView, ReadReceiptView, SenderView};
use murmur_shared::types::{ChannelId, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMessage {
    pub client_temp_id: String,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    pub content: String,
    pub reply_to: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

impl PendingMessage {
    /// Confirmed view built from local data, used when the ack beats the echo.
    fn confirm(&self, id: MessageId, sender_name: Option<String>) -> MessageView {
        MessageView {
            id,
            channel_id: self.channel_id,
            sender: SenderView {
                id: self.sender_id,
                display_name: sender_name,
                status: None,
            },
            content: self.content.clone(),
            reply_to: None,
            reactions: Vec::new(),
            read_by: Vec::new(),
            system: false,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum TimelineEntry {
    Pending(PendingMessage),
    Confirmed(MessageView),
}

impl TimelineEntry {
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            TimelineEntry::Pending(_) => None,
            TimelineEntry::Confirmed(view) => Some(view.id),
        }
    }

    pub fn client_temp_id(&self) -> Option<&str> {
        match self {
            TimelineEntry::Pending(p) => Some(&p.client_temp_id),
            TimelineEntry::Confirmed(_) => None,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            TimelineEntry::Pending(p) => &p.content,
            TimelineEntry::Confirmed(view) => &view.content,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, TimelineEntry::Pending(_))
    }
}

/// Result of feeding one server event into a [`Timeline`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// A message not sent from this session was added at the end.
    Appended { own: bool },
    /// A pending entry became authoritative.
    Confirmed { client_temp_id: String },
    /// An existing entry was replaced with a newer copy of itself.
    Refreshed,
    /// Already reflected; nothing changed.
    Duplicate,
    /// Refers to nothing this timeline knows.
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Timeline {
    channel_id: ChannelId,
    self_id: UserId,
    self_name: Option<String>,
    entries: Vec<TimelineEntry>,
    /// Temp ids already confirmed, with the id they resolved to.
    resolved: HashMap<String, MessageId>,
}

impl Timeline {
    pub fn new(channel_id: ChannelId, self_id: UserId, self_name: Option<String>) -> Self {
        Self {
            channel_id,
            self_id,
            self_name,
            entries: Vec::new(),
            resolved: HashMap::new(),
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_pending()).count()
    }

    fn position_of_id(&self, id: MessageId) -> Option<usize> {
        self.entries.iter().position(|e| e.message_id() == Some(id))
    }

    fn position_of_temp(&self, client_temp_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.client_temp_id() == Some(client_temp_id))
    }

    /// Append a pending entry and return it; the caller sends it.
    pub fn begin_send(&mut self, content: String, reply_to: Option<MessageId>) -> PendingMessage {
        let pending = PendingMessage {
            client_temp_id: Uuid::new_v4().simple().to_string(),
            channel_id: self.channel_id,
            sender_id: self.self_id,
            content,
            reply_to,
            created_at: Utc::now(),
        };
        trace!(temp = %pending.client_temp_id, channel = %self.channel_id, "Pending message added");
        self.entries.push(TimelineEntry::Pending(pending.clone()));
        pending
    }

    /// `message-delivered` for one of our sends.
    pub fn on_ack(&mut self, client_temp_id: &str, id: MessageId) -> Reconciled {
        let previously = self.resolved.get(client_temp_id).copied();
        if previously == Some(id) {
            return Reconciled::Duplicate;
        }

        let outcome = match (self.position_of_temp(client_temp_id), self.position_of_id(id)) {
            (Some(at), None) => {
                if let TimelineEntry::Pending(pending) = &self.entries[at] {
                    let view = pending.confirm(id, self.self_name.clone());
                    self.entries[at] = TimelineEntry::Confirmed(view);
                }
                Reconciled::Confirmed {
                    client_temp_id: client_temp_id.to_string(),
                }
            }
            (Some(at), Some(_)) => {
                // the echo is already on screen as its own entry
                self.entries.remove(at);
                Reconciled::Confirmed {
                    client_temp_id: client_temp_id.to_string(),
                }
            }
            (None, Some(_)) => Reconciled::Duplicate,
            (None, None) => match previously.and_then(|other| self.position_of_id(other)) {
                // an echo from another session took our slot by content; ours
                // is still owed a visible entry
                Some(at) => {
                    if let TimelineEntry::Confirmed(taken) = &self.entries[at] {
                        let mut view = taken.clone();
                        view.id = id;
                        self.entries.insert(at + 1, TimelineEntry::Confirmed(view));
                    }
                    Reconciled::Confirmed {
                        client_temp_id: client_temp_id.to_string(),
                    }
                }
                None => return Reconciled::Unknown,
            },
        };

        self.resolved.insert(client_temp_id.to_string(), id);
        outcome
    }

    /// `new-message` broadcast for this channel.
    pub fn on_new_message(&mut self, view: MessageView) -> Reconciled {
        if let Some(at) = self.position_of_id(view.id) {
            return self.replace(at, view);
        }

        if view.sender.id == self.self_id {
            if let Some(at) = self.match_pending(&view) {
                let client_temp_id = self.entries[at]
                    .client_temp_id()
                    .map(str::to_string)
                    .unwrap_or_default();
                debug!(temp = %client_temp_id, message = %view.id, "Echo confirmed pending message");
                self.resolved.insert(client_temp_id.clone(), view.id);
                self.entries[at] = TimelineEntry::Confirmed(view);
                return Reconciled::Confirmed { client_temp_id };
            }
        }

        let own = view.sender.id == self.self_id;
        self.entries.push(TimelineEntry::Confirmed(view));
        Reconciled::Appended { own }
    }

    /// Best-effort match for an echo that beat its ack: the oldest pending
    /// entry with the same content.
    fn match_pending(&self, view: &MessageView) -> Option<usize> {
        self.entries.iter().position(|e| match e {
            TimelineEntry::Pending(p) => p.channel_id == view.channel_id && p.content == view.content,
            TimelineEntry::Confirmed(_) => false,
        })
    }

    fn replace(&mut self, at: usize, view: MessageView) -> Reconciled {
        if let TimelineEntry::Confirmed(existing) = &self.entries[at] {
            if *existing == view {
                return Reconciled::Duplicate;
            }
        }
        self.entries[at] = TimelineEntry::Confirmed(view);
        Reconciled::Refreshed
    }

    /// The server rejected one of our sends. The pending entry is removed
    /// and returned so the caller can offer a retry.
    pub fn on_send_failed(&mut self, client_temp_id: &str) -> Option<PendingMessage> {
        let at = self.position_of_temp(client_temp_id)?;
        match self.entries.remove(at) {
            TimelineEntry::Pending(pending) => Some(pending),
            TimelineEntry::Confirmed(_) => None,
        }
    }

    /// `message-updated`: replace a message we already show.
    pub fn on_updated(&mut self, view: MessageView) -> Reconciled {
        match self.position_of_id(view.id) {
            Some(at) => self.replace(at, view),
            None => Reconciled::Unknown,
        }
    }

    pub fn on_deleted(&mut self, id: MessageId) -> bool {
        match self.position_of_id(id) {
            Some(at) => {
                self.entries.remove(at);
                true
            }
            None => false,
        }
    }

    /// Record that `user_id` read everything they did not write.
    pub fn on_read(&mut self, user_id: UserId, read_at: DateTime<Utc>) -> usize {
        let mut marked = 0;
        for entry in &mut self.entries {
            let TimelineEntry::Confirmed(view) = entry else {
                continue;
            };
            if view.sender.id == user_id || view.read_by.iter().any(|r| r.user_id == user_id) {
                continue;
            }
            view.read_by.push(ReadReceiptView { user_id, read_at });
            marked += 1;
        }
        marked
    }

    /// Put an older history page (oldest first) in front of what is shown.
    /// Messages already present are skipped.
    pub fn prepend_history(&mut self, page: Vec<MessageView>) -> usize {
        let fresh: Vec<TimelineEntry> = page
            .into_iter()
            .filter(|view| self.position_of_id(view.id).is_none())
            .map(TimelineEntry::Confirmed)
            .collect();
        let added = fresh.len();
        self.entries.splice(0..0, fresh);
        added
    }
}
