//! Store wrapper for tests that need storage to fail or stall.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use murmur_shared::types::{ChannelId, MessageId, PresenceStatus, UserId};
use murmur_store::{
    Channel, ChatStore, Message, ReactionSummary, ReadReceipt, SqliteStore, StoreError, User,
};

type StoreResult<T> = murmur_store::Result<T>;

/// Delegates to SQLite but can be told to fail or delay selected calls.
pub struct FlakyStore {
    pub inner: SqliteStore,
    pub fail_inserts: bool,
    pub fail_user_lookup: bool,
    /// Held before writing an `offline` status.
    pub offline_write_delay: Duration,
}

impl FlakyStore {
    pub fn new(inner: SqliteStore) -> Self {
        Self {
            inner,
            fail_inserts: false,
            fail_user_lookup: false,
            offline_write_delay: Duration::ZERO,
        }
    }
}

fn broken() -> StoreError {
    StoreError::Task("storage unavailable".into())
}

#[async_trait]
impl ChatStore for FlakyStore {
    async fn get_user(&self, id: UserId) -> StoreResult<Option<User>> {
        if self.fail_user_lookup {
            return Err(broken());
        }
        self.inner.get_user(id).await
    }
    async fn set_user_status(&self, id: UserId, status: PresenceStatus, at: DateTime<Utc>) -> StoreResult<()> {
        if status == PresenceStatus::Offline && !self.offline_write_delay.is_zero() {
            tokio::time::sleep(self.offline_write_delay).await;
        }
        self.inner.set_user_status(id, status, at).await
    }
    async fn get_channel(&self, id: ChannelId) -> StoreResult<Option<Channel>> {
        self.inner.get_channel(id).await
    }
    async fn channels_for_user(&self, user_id: UserId) -> StoreResult<Vec<Channel>> {
        self.inner.channels_for_user(user_id).await
    }
    async fn insert_message(&self, message: Message) -> StoreResult<()> {
        if self.fail_inserts {
            return Err(broken());
        }
        self.inner.insert_message(message).await
    }
    async fn get_message(&self, id: MessageId) -> StoreResult<Option<Message>> {
        self.inner.get_message(id).await
    }
    async fn list_messages(&self, channel_id: ChannelId, limit: u32, before: Option<MessageId>) -> StoreResult<Vec<Message>> {
        self.inner.list_messages(channel_id, limit, before).await
    }
    async fn soft_delete_message(&self, id: MessageId, sender_id: UserId, at: DateTime<Utc>) -> StoreResult<bool> {
        self.inner.soft_delete_message(id, sender_id, at).await
    }
    async fn add_reaction(&self, message_id: MessageId, user_id: UserId, emoji: String) -> StoreResult<bool> {
        self.inner.add_reaction(message_id, user_id, emoji).await
    }
    async fn remove_reaction(&self, message_id: MessageId, user_id: UserId, emoji: String) -> StoreResult<bool> {
        self.inner.remove_reaction(message_id, user_id, emoji).await
    }
    async fn reactions_for(&self, message_id: MessageId) -> StoreResult<Vec<ReactionSummary>> {
        self.inner.reactions_for(message_id).await
    }
    async fn read_receipts_for(&self, message_id: MessageId) -> StoreResult<Vec<ReadReceipt>> {
        self.inner.read_receipts_for(message_id).await
    }
    async fn mark_channel_read(&self, channel_id: ChannelId, user_id: UserId, at: DateTime<Utc>) -> StoreResult<usize> {
        self.inner.mark_channel_read(channel_id, user_id, at).await
    }
}
