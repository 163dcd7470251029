//! Message pipeline: authorize, validate, persist, then broadcast.
//!
//! Nothing reaches a room until the store has acknowledged the write. Once
//! a message is stored, failures while expanding it for display (sender
//! profile, reply preview, reactions) only degrade the view.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use murmur_shared::protocol::{
    validate_content, MessageDeleted, MessageView, MessagesRead, ReactionView, ReadReceiptView,
    ReplyPreview, SendMessage, SenderView, ServerEvent,
};
use murmur_shared::types::{ChannelId, MessageId, UserId};
use murmur_store::{ChatStore, Message};

use crate::auth::Identity;
use crate::error::ServerError;
use crate::gate::MembershipGate;
use crate::registry::{ConnectionRegistry, Skip};

#[derive(Clone)]
pub struct MessagePipeline {
    store: Arc<dyn ChatStore>,
    gate: MembershipGate,
    registry: ConnectionRegistry,
    max_message_len: usize,
}

impl MessagePipeline {
    pub fn new(
        store: Arc<dyn ChatStore>,
        gate: MembershipGate,
        registry: ConnectionRegistry,
        max_message_len: usize,
    ) -> Self {
        Self {
            store,
            gate,
            registry,
            max_message_len,
        }
    }

    /// Store a message and deliver it to the channel's room, the sender's
    /// own subscribed connections included.
    pub async fn send(&self, identity: &Identity, request: SendMessage) -> Result<MessageView, ServerError> {
        let channel_id = request.channel_id;
        self.gate.authorize(identity.user_id, channel_id).await?;
        validate_content(&request.content, false, self.max_message_len)?;

        let reply_to = match request.reply_to {
            Some(target) => self.resolve_reply(target, channel_id).await?,
            None => None,
        };

        let mut message = Message::new(channel_id, identity.user_id, request.content);
        message.reply_to = reply_to;

        self.store.insert_message(message.clone()).await.map_err(|e| {
            error!(error = %e, channel = %channel_id, "Failed to persist message");
            ServerError::from(e)
        })?;

        let view = self.render(&message).await;
        let recipients = self
            .registry
            .broadcast_room(channel_id, ServerEvent::NewMessage(view.clone()), Skip::Nobody)
            .await;

        info!(
            message = %message.id,
            channel = %channel_id,
            sender = %identity.user_id,
            recipients,
            "Message delivered"
        );
        Ok(view)
    }

    /// A reply target that is missing, deleted or in another channel is
    /// dropped and the message is sent without it.
    async fn resolve_reply(
        &self,
        target: MessageId,
        channel_id: ChannelId,
    ) -> Result<Option<MessageId>, ServerError> {
        match self.store.get_message(target).await? {
            Some(parent) if !parent.is_deleted() && parent.channel_id == channel_id => Ok(Some(target)),
            _ => {
                debug!(reply_to = %target, "Reply target unavailable, sending without it");
                Ok(None)
            }
        }
    }

    pub async fn add_reaction(
        &self,
        identity: &Identity,
        message_id: MessageId,
        emoji: String,
    ) -> Result<MessageView, ServerError> {
        let message = self.live_message(message_id).await?;
        self.gate.authorize(identity.user_id, message.channel_id).await?;

        let added = self
            .store
            .add_reaction(message_id, identity.user_id, emoji)
            .await
            .map_err(|e| {
                error!(error = %e, message = %message_id, "Failed to store reaction");
                ServerError::from(e)
            })?;
        debug!(message = %message_id, added, "Reaction added");

        self.publish_update(&message).await
    }

    pub async fn remove_reaction(
        &self,
        identity: &Identity,
        message_id: MessageId,
        emoji: String,
    ) -> Result<MessageView, ServerError> {
        let message = self.live_message(message_id).await?;
        self.gate.authorize(identity.user_id, message.channel_id).await?;

        let removed = self
            .store
            .remove_reaction(message_id, identity.user_id, emoji)
            .await
            .map_err(|e| {
                error!(error = %e, message = %message_id, "Failed to remove reaction");
                ServerError::from(e)
            })?;
        debug!(message = %message_id, removed, "Reaction removed");

        self.publish_update(&message).await
    }

    /// Soft-delete on behalf of the sender. Someone else's message reports
    /// `not-found`, the same as a missing one.
    pub async fn delete(&self, identity: &Identity, message_id: MessageId) -> Result<MessageDeleted, ServerError> {
        let not_found = || ServerError::NotFound("Message not found or access denied".into());

        let message = match self.store.get_message(message_id).await? {
            Some(m) if !m.is_deleted() && m.sender_id == identity.user_id => m,
            _ => return Err(not_found()),
        };

        let deleted = self
            .store
            .soft_delete_message(message_id, identity.user_id, Utc::now())
            .await
            .map_err(|e| {
                error!(error = %e, message = %message_id, "Failed to delete message");
                ServerError::from(e)
            })?;
        if !deleted {
            return Err(not_found());
        }

        let event = MessageDeleted {
            channel_id: message.channel_id,
            message_id,
        };
        self.registry
            .broadcast_room(message.channel_id, ServerEvent::MessageDeleted(event.clone()), Skip::Nobody)
            .await;

        info!(message = %message_id, channel = %message.channel_id, "Message deleted");
        Ok(event)
    }

    /// A page of history, oldest first. Reading marks the channel read for
    /// the caller.
    pub async fn history(
        &self,
        identity: &Identity,
        channel_id: ChannelId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessageView>, ServerError> {
        self.gate.authorize(identity.user_id, channel_id).await?;

        if let Err(e) = self
            .store
            .mark_channel_read(channel_id, identity.user_id, Utc::now())
            .await
        {
            error!(error = %e, channel = %channel_id, "Failed to record read receipts");
        }

        let messages = self
            .store
            .list_messages(channel_id, limit, before)
            .await
            .map_err(|e| {
                error!(error = %e, channel = %channel_id, "Failed to load history");
                ServerError::from(e)
            })?;

        let mut views = Vec::with_capacity(messages.len());
        for message in &messages {
            views.push(self.render(message).await);
        }
        Ok(views)
    }

    /// Record receipts for everything in the channel and tell the room.
    pub async fn mark_read(
        &self,
        identity: &Identity,
        channel_id: ChannelId,
        skip: Skip,
    ) -> Result<MessagesRead, ServerError> {
        self.gate.authorize(identity.user_id, channel_id).await?;

        let read_at = Utc::now();
        let marked = self
            .store
            .mark_channel_read(channel_id, identity.user_id, read_at)
            .await
            .map_err(|e| {
                error!(error = %e, channel = %channel_id, "Failed to record read receipts");
                ServerError::from(e)
            })?;
        debug!(channel = %channel_id, user = %identity.user_id, marked, "Channel marked read");

        let event = MessagesRead {
            channel_id,
            user_id: identity.user_id,
            read_at,
        };
        self.registry
            .broadcast_room(channel_id, ServerEvent::MessagesRead(event.clone()), skip)
            .await;
        Ok(event)
    }

    async fn live_message(&self, message_id: MessageId) -> Result<Message, ServerError> {
        match self.store.get_message(message_id).await? {
            Some(message) if !message.is_deleted() => Ok(message),
            _ => Err(ServerError::NotFound("Message not found".into())),
        }
    }

    async fn publish_update(&self, message: &Message) -> Result<MessageView, ServerError> {
        let view = self.render(message).await;
        self.registry
            .broadcast_room(message.channel_id, ServerEvent::MessageUpdated(view.clone()), Skip::Nobody)
            .await;
        Ok(view)
    }

    /// Expand a stored message for display.
    pub async fn render(&self, message: &Message) -> MessageView {
        let sender = match self.store.get_user(message.sender_id).await {
            Ok(Some(user)) => SenderView {
                id: user.id,
                display_name: Some(user.display_name),
                status: Some(user.status),
            },
            Ok(None) => self.anonymous(message.sender_id),
            Err(e) => {
                warn!(error = %e, sender = %message.sender_id, "Sender lookup failed");
                self.anonymous(message.sender_id)
            }
        };

        let reply_to = match message.reply_to {
            Some(parent) => self.reply_preview(parent).await,
            None => None,
        };

        let reactions = match self.store.reactions_for(message.id).await {
            Ok(summaries) => summaries
                .into_iter()
                .map(|s| ReactionView {
                    count: s.count(),
                    emoji: s.emoji,
                    users: s.users,
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, message = %message.id, "Reaction lookup failed");
                Vec::new()
            }
        };

        let read_by = match self.store.read_receipts_for(message.id).await {
            Ok(receipts) => receipts
                .into_iter()
                .map(|r| ReadReceiptView {
                    user_id: r.user_id,
                    read_at: r.read_at,
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, message = %message.id, "Read receipt lookup failed");
                Vec::new()
            }
        };

        MessageView {
            id: message.id,
            channel_id: message.channel_id,
            sender,
            content: message.content.clone(),
            reply_to,
            reactions,
            read_by,
            system: message.is_system,
            created_at: message.created_at,
        }
    }

    fn anonymous(&self, id: UserId) -> SenderView {
        SenderView {
            id,
            display_name: None,
            status: None,
        }
    }

    async fn reply_preview(&self, parent: MessageId) -> Option<ReplyPreview> {
        let message = match self.store.get_message(parent).await {
            Ok(Some(m)) if !m.is_deleted() => m,
            Ok(_) => return None,
            Err(e) => {
                warn!(error = %e, reply_to = %parent, "Reply lookup failed");
                return None;
            }
        };

        let sender_name = match self.store.get_user(message.sender_id).await {
            Ok(user) => user.map(|u| u.display_name),
            Err(e) => {
                warn!(error = %e, "Reply sender lookup failed");
                None
            }
        };

        Some(ReplyPreview {
            id: message.id,
            content: message.content,
            sender_name,
        })
    }
}
