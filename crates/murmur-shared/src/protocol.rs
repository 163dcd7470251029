use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_CLIENT_TEMP_ID_LEN, MAX_EMOJI_LEN};
use crate::error::ProtocolError;
use crate::types::{ChannelId, MessageId, PresenceStatus, UserId};

/// Frames a connected client may send.
///
/// Encoded as `{"type": "send-message", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinChannel(ChannelRef),
    LeaveChannel(ChannelRef),
    SendMessage(SendMessage),
    TypingStart(ChannelRef),
    TypingStop(ChannelRef),
    AddReaction(ReactionRef),
    RemoveReaction(ReactionRef),
    DeleteMessage(MessageRef),
    MarkRead(ChannelRef),
    UpdateStatus(StatusUpdate),
}

/// Frames the server pushes to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Sender only: correlates the client's temporary id with the stored id.
    MessageDelivered(Delivered),
    NewMessage(MessageView),
    MessageUpdated(MessageView),
    MessageDeleted(MessageDeleted),
    TypingStarted(TypingSignal),
    TypingStopped(TypingSignal),
    StatusChanged(StatusChanged),
    MemberJoined(MemberEvent),
    MemberLeft(MemberEvent),
    MessagesRead(MessagesRead),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRef {
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub channel_id: ChannelId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_temp_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionRef {
    pub message_id: MessageId,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivered {
    pub client_temp_id: Option<String>,
    pub message_id: MessageId,
}

/// A stored message with the sender (and reply target) expanded for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub sender: SenderView,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyPreview>,
    #[serde(default)]
    pub reactions: Vec<ReactionView>,
    #[serde(default)]
    pub read_by: Vec<ReadReceiptView>,
    #[serde(default)]
    pub system: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderView {
    pub id: UserId,
    /// `None` when the profile lookup failed; the message is still delivered.
    pub display_name: Option<String>,
    pub status: Option<PresenceStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPreview {
    pub id: MessageId,
    pub content: String,
    pub sender_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionView {
    pub emoji: String,
    pub users: Vec<UserId>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptView {
    pub user_id: UserId,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub user_id: UserId,
    pub channel_id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChanged {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberEvent {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesRead {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub read_at: DateTime<Utc>,
}

/// Error taxonomy reported to the originating connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    AuthenticationError,
    AccessDenied,
    ValidationFailed,
    NotFound,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthenticationError => "authentication-error",
            Self::AccessDenied => "access-denied",
            Self::ValidationFailed => "validation-failed",
            Self::NotFound => "not-found",
            Self::InternalError => "internal-error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
    pub kind: ErrorKind,
    /// Set when the error answers a `send-message` carrying a temp id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_temp_id: Option<String>,
}

impl ClientEvent {
    /// Parse and shape-check a text frame.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let event: Self = serde_json::from_str(text)?;
        event.validate()?;
        Ok(event)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Best-effort `clientTempId` of a `send-message` frame that did not
    /// decode, so the rejection can still be matched to the pending send.
    pub fn salvage_temp_id(text: &str) -> Option<String> {
        let frame: serde_json::Value = serde_json::from_str(text).ok()?;
        if frame.get("type")?.as_str()? != "send-message" {
            return None;
        }
        let temp_id = frame.get("data")?.get("clientTempId")?.as_str()?;
        let len = temp_id.chars().count();
        (len > 0 && len <= MAX_CLIENT_TEMP_ID_LEN).then(|| temp_id.to_string())
    }

    /// Checks that do not need the store. Content length is left to the
    /// server because its limit is configurable.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Self::SendMessage(send) => {
                if let Some(temp_id) = &send.client_temp_id {
                    if temp_id.is_empty() || temp_id.chars().count() > MAX_CLIENT_TEMP_ID_LEN {
                        return Err(ProtocolError::Invalid(format!(
                            "clientTempId must be 1..={MAX_CLIENT_TEMP_ID_LEN} characters"
                        )));
                    }
                }
                Ok(())
            }
            Self::AddReaction(reaction) | Self::RemoveReaction(reaction) => {
                let len = reaction.emoji.chars().count();
                if reaction.emoji.trim().is_empty() || len > MAX_EMOJI_LEN {
                    return Err(ProtocolError::Invalid(format!(
                        "emoji must be 1..={MAX_EMOJI_LEN} characters"
                    )));
                }
                Ok(())
            }
            Self::UpdateStatus(update) if !update.status.is_user_selectable() => Err(
                ProtocolError::Invalid("status cannot be set to offline".into()),
            ),
            _ => Ok(()),
        }
    }
}

impl ServerEvent {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
            kind,
            client_temp_id: None,
        })
    }

    /// Short name used in log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageDelivered(_) => "message-delivered",
            Self::NewMessage(_) => "new-message",
            Self::MessageUpdated(_) => "message-updated",
            Self::MessageDeleted(_) => "message-deleted",
            Self::TypingStarted(_) => "typing-started",
            Self::TypingStopped(_) => "typing-stopped",
            Self::StatusChanged(_) => "status-changed",
            Self::MemberJoined(_) => "member-joined",
            Self::MemberLeft(_) => "member-left",
            Self::MessagesRead(_) => "messages-read",
            Self::Error(_) => "error",
        }
    }
}

/// Content rule shared by server and client: non-empty unless it is a system
/// message, and at most `max_len` characters.
pub fn validate_content(content: &str, system: bool, max_len: usize) -> Result<(), ProtocolError> {
    if !system && content.trim().is_empty() {
        return Err(ProtocolError::Invalid("message content is required".into()));
    }
    let len = content.chars().count();
    if len > max_len {
        return Err(ProtocolError::Invalid(format!(
            "message cannot exceed {max_len} characters (got {len})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send_message_frame() {
        let channel = ChannelId::new();
        let text = format!(
            r#"{{"type":"send-message","data":{{"channelId":"{}","content":"hello","clientTempId":"t1"}}}}"#,
            channel
        );

        let event = ClientEvent::from_json(&text).unwrap();
        assert_eq!(
            event,
            ClientEvent::SendMessage(SendMessage {
                channel_id: channel,
                content: "hello".into(),
                reply_to: None,
                client_temp_id: Some("t1".into()),
            })
        );
    }

    #[test]
    fn test_unknown_event_rejected() {
        let err = ClientEvent::from_json(r#"{"type":"shout","data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_missing_field_rejected() {
        let err = ClientEvent::from_json(r#"{"type":"join-channel","data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_empty_emoji_rejected() {
        let text = format!(
            r#"{{"type":"add-reaction","data":{{"messageId":"{}","emoji":" "}}}}"#,
            MessageId::new()
        );
        assert!(matches!(
            ClientEvent::from_json(&text),
            Err(ProtocolError::Invalid(_))
        ));
    }

    #[test]
    fn test_client_cannot_choose_offline() {
        let text = r#"{"type":"update-status","data":{"status":"offline"}}"#;
        assert!(matches!(
            ClientEvent::from_json(text),
            Err(ProtocolError::Invalid(_))
        ));

        let text = r#"{"type":"update-status","data":{"status":"busy"}}"#;
        assert!(ClientEvent::from_json(text).is_ok());
    }

    #[test]
    fn test_error_event_wire_shape() {
        let json = ServerEvent::error(ErrorKind::AccessDenied, "Access denied to this channel")
            .to_json()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"]["kind"], "access-denied");
        assert!(value["data"].get("clientTempId").is_none());
    }

    #[test]
    fn test_validate_content_rules() {
        assert!(validate_content("hi", false, 10).is_ok());
        assert!(validate_content("   ", false, 10).is_err());
        assert!(validate_content("", true, 10).is_ok());
        assert!(validate_content(&"x".repeat(11), false, 10).is_err());
        // limit counts characters, not bytes
        assert!(validate_content(&"é".repeat(10), false, 10).is_ok());
    }

    #[test]
    fn test_salvage_temp_id_from_bad_send() {
        let missing_channel = r#"{"type":"send-message","data":{"content":"hi","clientTempId":"tmp-7"}}"#;
        assert!(ClientEvent::from_json(missing_channel).is_err());
        assert_eq!(ClientEvent::salvage_temp_id(missing_channel), Some("tmp-7".to_string()));

        let other = r#"{"type":"typing-start","data":{"clientTempId":"tmp-7"}}"#;
        assert_eq!(ClientEvent::salvage_temp_id(other), None);
        assert_eq!(ClientEvent::salvage_temp_id("{not json"), None);

        let too_long = format!(
            r#"{{"type":"send-message","data":{{"clientTempId":"{}"}}}}"#,
            "x".repeat(MAX_CLIENT_TEMP_ID_LEN + 1)
        );
        assert_eq!(ClientEvent::salvage_temp_id(&too_long), None);
    }
}
