//! Client-side view of the chat, fed by server events.
//!
//! [`ClientState`] owns one [`Timeline`] per channel plus the typing and
//! presence rosters. The transport layer hands every decoded frame to
//! [`ClientState::apply`] and forwards the returned [`ClientNotice`] to the UI.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, warn};

use murmur_shared::constants::MAX_MESSAGE_LEN;
use murmur_shared::protocol::{
    validate_content, ClientEvent, ErrorPayload, MessageView, SendMessage, ServerEvent,
};
use murmur_shared::types::{ChannelId, MessageId, UserId};

use crate::error::{ClientError, Result};
use crate::events::ClientNotice;
use crate::presence::PresenceRoster;
use crate::timeline::{Reconciled, Timeline};
use crate::typing::TypingRoster;

pub struct ClientState {
    self_id: UserId,
    display_name: Option<String>,
    max_message_len: usize,
    timelines: HashMap<ChannelId, Timeline>,
    /// Sends still waiting for an ack or an error, by temp id.
    outgoing: HashMap<String, ChannelId>,
    typing: TypingRoster,
    presence: PresenceRoster,
}

impl ClientState {
    pub fn new(self_id: UserId, display_name: Option<String>) -> Self {
        Self {
            self_id,
            display_name,
            max_message_len: MAX_MESSAGE_LEN,
            timelines: HashMap::new(),
            outgoing: HashMap::new(),
            typing: TypingRoster::new(),
            presence: PresenceRoster::new(),
        }
    }

    pub fn with_max_message_len(mut self, max_message_len: usize) -> Self {
        self.max_message_len = max_message_len;
        self
    }

    pub fn self_id(&self) -> UserId {
        self.self_id
    }

    pub fn timeline(&self, channel_id: ChannelId) -> Option<&Timeline> {
        self.timelines.get(&channel_id)
    }

    pub fn typing(&self) -> &TypingRoster {
        &self.typing
    }

    pub fn typing_mut(&mut self) -> &mut TypingRoster {
        &mut self.typing
    }

    pub fn presence(&self) -> &PresenceRoster {
        &self.presence
    }

    pub fn pending_sends(&self) -> usize {
        self.outgoing.len()
    }

    fn timeline_mut(&mut self, channel_id: ChannelId) -> &mut Timeline {
        let (self_id, name) = (self.self_id, self.display_name.clone());
        self.timelines
            .entry(channel_id)
            .or_insert_with(|| Timeline::new(channel_id, self_id, name))
    }

    /// Show a message optimistically and build the frame that sends it.
    /// Content is checked locally so obviously bad input never leaves.
    pub fn send(
        &mut self,
        channel_id: ChannelId,
        content: &str,
        reply_to: Option<MessageId>,
    ) -> Result<ClientEvent> {
        validate_content(content, false, self.max_message_len)
            .map_err(|e| ClientError::Rejected(e.to_string()))?;

        let pending = self.timeline_mut(channel_id).begin_send(content.to_string(), reply_to);
        self.outgoing
            .insert(pending.client_temp_id.clone(), channel_id);

        Ok(ClientEvent::SendMessage(SendMessage {
            channel_id,
            content: pending.content,
            reply_to: pending.reply_to,
            client_temp_id: Some(pending.client_temp_id),
        }))
    }

    /// Merge an older history page (oldest first).
    pub fn load_history(&mut self, channel_id: ChannelId, page: Vec<MessageView>) -> usize {
        self.timeline_mut(channel_id).prepend_history(page)
    }

    /// Decode a text frame and apply it.
    pub fn apply_frame(&mut self, text: &str) -> Result<ClientNotice> {
        let event = ServerEvent::from_json(text)?;
        Ok(self.apply(event))
    }

    pub fn apply(&mut self, event: ServerEvent) -> ClientNotice {
        match event {
            ServerEvent::MessageDelivered(ack) => {
                let Some(temp_id) = ack.client_temp_id else {
                    return ClientNotice::None;
                };
                let Some(channel_id) = self.outgoing.remove(&temp_id) else {
                    // already confirmed by the echo
                    return ClientNotice::None;
                };
                match self.timeline_mut(channel_id).on_ack(&temp_id, ack.message_id) {
                    Reconciled::Confirmed { client_temp_id } => ClientNotice::MessageConfirmed {
                        channel_id,
                        client_temp_id,
                        message_id: ack.message_id,
                    },
                    _ => ClientNotice::None,
                }
            }

            ServerEvent::NewMessage(view) => {
                let (channel_id, message_id) = (view.channel_id, view.id);
                self.typing.stopped(channel_id, view.sender.id);
                match self.timeline_mut(channel_id).on_new_message(view) {
                    Reconciled::Appended { own } => ClientNotice::MessageAdded {
                        channel_id,
                        message_id,
                        own,
                    },
                    Reconciled::Confirmed { client_temp_id } => {
                        self.outgoing.remove(&client_temp_id);
                        ClientNotice::MessageConfirmed {
                            channel_id,
                            client_temp_id,
                            message_id,
                        }
                    }
                    Reconciled::Refreshed => ClientNotice::MessageChanged {
                        channel_id,
                        message_id,
                    },
                    Reconciled::Duplicate | Reconciled::Unknown => ClientNotice::None,
                }
            }

            ServerEvent::MessageUpdated(view) => {
                let (channel_id, message_id) = (view.channel_id, view.id);
                match self.timeline_mut(channel_id).on_updated(view) {
                    Reconciled::Refreshed => ClientNotice::MessageChanged {
                        channel_id,
                        message_id,
                    },
                    _ => ClientNotice::None,
                }
            }

            ServerEvent::MessageDeleted(deleted) => {
                if self.timeline_mut(deleted.channel_id).on_deleted(deleted.message_id) {
                    ClientNotice::MessageRemoved {
                        channel_id: deleted.channel_id,
                        message_id: deleted.message_id,
                    }
                } else {
                    ClientNotice::None
                }
            }

            ServerEvent::TypingStarted(signal) => {
                let channel_id = signal.channel_id;
                if signal.user_id == self.self_id {
                    return ClientNotice::None;
                }
                if self.typing.started(signal, Utc::now()) {
                    ClientNotice::TypingChanged { channel_id }
                } else {
                    ClientNotice::None
                }
            }

            ServerEvent::TypingStopped(signal) => {
                if self.typing.stopped(signal.channel_id, signal.user_id) {
                    ClientNotice::TypingChanged {
                        channel_id: signal.channel_id,
                    }
                } else {
                    ClientNotice::None
                }
            }

            ServerEvent::StatusChanged(change) => {
                let (user_id, status) = (change.user_id, change.status);
                if self.presence.apply(change) {
                    ClientNotice::PresenceChanged { user_id, status }
                } else {
                    ClientNotice::None
                }
            }

            ServerEvent::MemberJoined(member) => ClientNotice::MembershipChanged {
                channel_id: member.channel_id,
                user_id: member.user_id,
                joined: true,
            },

            ServerEvent::MemberLeft(member) => {
                self.typing.stopped(member.channel_id, member.user_id);
                ClientNotice::MembershipChanged {
                    channel_id: member.channel_id,
                    user_id: member.user_id,
                    joined: false,
                }
            }

            ServerEvent::MessagesRead(read) => {
                self.timeline_mut(read.channel_id).on_read(read.user_id, read.read_at);
                ClientNotice::ReadReceipt {
                    channel_id: read.channel_id,
                    user_id: read.user_id,
                }
            }

            ServerEvent::Error(payload) => self.on_error(payload),
        }
    }

    fn on_error(&mut self, payload: ErrorPayload) -> ClientNotice {
        let failed = payload
            .client_temp_id
            .as_ref()
            .and_then(|temp_id| self.outgoing.remove(temp_id).map(|c| (temp_id.clone(), c)));

        let Some((temp_id, channel_id)) = failed else {
            warn!(kind = %payload.kind, "Server error: {}", payload.message);
            return ClientNotice::ServerError {
                kind: payload.kind,
                message: payload.message,
            };
        };

        match self.timeline_mut(channel_id).on_send_failed(&temp_id) {
            Some(pending) => {
                debug!(temp = %temp_id, kind = %payload.kind, "Send failed");
                ClientNotice::SendFailed {
                    channel_id,
                    client_temp_id: temp_id,
                    content: pending.content,
                    kind: payload.kind,
                    reason: payload.message,
                }
            }
            None => ClientNotice::None,
        }
    }

    /// The socket dropped; typing signals will not get their stops.
    pub fn disconnected(&mut self) {
        self.typing.clear();
    }
}
