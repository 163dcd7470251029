//! Notices handed to the UI after a server event has been applied.

use serde::Serialize;

use murmur_shared::protocol::ErrorKind;
use murmur_shared::types::{ChannelId, MessageId, PresenceStatus, UserId};

pub const EVENT_MESSAGE_ADDED: &str = "message-added";
pub const EVENT_MESSAGE_CONFIRMED: &str = "message-confirmed";
pub const EVENT_MESSAGE_CHANGED: &str = "message-changed";
pub const EVENT_MESSAGE_REMOVED: &str = "message-removed";
pub const EVENT_SEND_FAILED: &str = "send-failed";
pub const EVENT_TYPING_CHANGED: &str = "typing-changed";
pub const EVENT_PRESENCE_CHANGED: &str = "presence-changed";
pub const EVENT_MEMBERSHIP_CHANGED: &str = "membership-changed";
pub const EVENT_READ_RECEIPT: &str = "read-receipt";
pub const EVENT_SERVER_ERROR: &str = "server-error";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "notice", rename_all = "camelCase")]
pub enum ClientNotice {
    /// Nothing visible changed (duplicate delivery, unknown channel, ...).
    None,
    #[serde(rename_all = "camelCase")]
    MessageAdded {
        channel_id: ChannelId,
        message_id: MessageId,
        /// Sent by this user from another session; the UI should not notify.
        own: bool,
    },
    #[serde(rename_all = "camelCase")]
    MessageConfirmed {
        channel_id: ChannelId,
        client_temp_id: String,
        message_id: MessageId,
    },
    #[serde(rename_all = "camelCase")]
    MessageChanged {
        channel_id: ChannelId,
        message_id: MessageId,
    },
    #[serde(rename_all = "camelCase")]
    MessageRemoved {
        channel_id: ChannelId,
        message_id: MessageId,
    },
    /// The optimistic entry was dropped; offer a retry with `content`.
    #[serde(rename_all = "camelCase")]
    SendFailed {
        channel_id: ChannelId,
        client_temp_id: String,
        content: String,
        kind: ErrorKind,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    TypingChanged { channel_id: ChannelId },
    #[serde(rename_all = "camelCase")]
    PresenceChanged {
        user_id: UserId,
        status: PresenceStatus,
    },
    #[serde(rename_all = "camelCase")]
    MembershipChanged {
        channel_id: ChannelId,
        user_id: UserId,
        joined: bool,
    },
    #[serde(rename_all = "camelCase")]
    ReadReceipt {
        channel_id: ChannelId,
        user_id: UserId,
    },
    ServerError { kind: ErrorKind, message: String },
}

impl ClientNotice {
    /// Event name for UI bridges, `None` when there is nothing to emit.
    pub fn event_name(&self) -> Option<&'static str> {
        let name = match self {
            ClientNotice::None => return None,
            ClientNotice::MessageAdded { .. } => EVENT_MESSAGE_ADDED,
            ClientNotice::MessageConfirmed { .. } => EVENT_MESSAGE_CONFIRMED,
            ClientNotice::MessageChanged { .. } => EVENT_MESSAGE_CHANGED,
            ClientNotice::MessageRemoved { .. } => EVENT_MESSAGE_REMOVED,
            ClientNotice::SendFailed { .. } => EVENT_SEND_FAILED,
            ClientNotice::TypingChanged { .. } => EVENT_TYPING_CHANGED,
            ClientNotice::PresenceChanged { .. } => EVENT_PRESENCE_CHANGED,
            ClientNotice::MembershipChanged { .. } => EVENT_MEMBERSHIP_CHANGED,
            ClientNotice::ReadReceipt { .. } => EVENT_READ_RECEIPT,
            ClientNotice::ServerError { .. } => EVENT_SERVER_ERROR,
        };
        Some(name)
    }
}
