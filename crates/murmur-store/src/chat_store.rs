//! Async facade over [`Database`] consumed by the real-time server.
//!
//! Every call is an independent commit. [`SqliteStore`] runs each one on
//! tokio's blocking pool so a slow disk never stalls connection tasks.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use murmur_shared::types::{ChannelId, MessageId, PresenceStatus, UserId};

use crate::database::Database;
use crate::error::{optional, Result, StoreError};
use crate::models::{Channel, Message, ReactionSummary, ReadReceipt, User};

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn get_user(&self, id: UserId) -> Result<Option<User>>;

    async fn set_user_status(
        &self,
        id: UserId,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    ) -> Result<()>;

    /// Channel with its member set, active or not.
    async fn get_channel(&self, id: ChannelId) -> Result<Option<Channel>>;

    async fn channels_for_user(&self, user_id: UserId) -> Result<Vec<Channel>>;

    async fn insert_message(&self, message: Message) -> Result<()>;

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>>;

    async fn list_messages(
        &self,
        channel_id: ChannelId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>>;

    async fn soft_delete_message(
        &self,
        id: MessageId,
        sender_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn add_reaction(&self, message_id: MessageId, user_id: UserId, emoji: String) -> Result<bool>;

    async fn remove_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
    ) -> Result<bool>;

    async fn reactions_for(&self, message_id: MessageId) -> Result<Vec<ReactionSummary>>;

    async fn read_receipts_for(&self, message_id: MessageId) -> Result<Vec<ReadReceipt>>;

    async fn mark_channel_read(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<usize>;
}

/// [`ChatStore`] backed by a single SQLite connection.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Database>>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open_at(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    /// Run a closure against the database on the blocking pool.
    pub async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| StoreError::Poisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        self.with_db(move |db| optional(db.get_user(id))).await
    }

    async fn set_user_status(
        &self,
        id: UserId,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    ) -> Result<()> {
        self.with_db(move |db| db.set_user_status(id, status, last_seen))
            .await
    }

    async fn get_channel(&self, id: ChannelId) -> Result<Option<Channel>> {
        self.with_db(move |db| optional(db.get_channel(id))).await
    }

    async fn channels_for_user(&self, user_id: UserId) -> Result<Vec<Channel>> {
        self.with_db(move |db| db.list_channels_for_user(user_id))
            .await
    }

    async fn insert_message(&self, message: Message) -> Result<()> {
        self.with_db(move |db| db.insert_message(&message)).await
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>> {
        self.with_db(move |db| optional(db.get_message(id))).await
    }

    async fn list_messages(
        &self,
        channel_id: ChannelId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        self.with_db(move |db| db.list_messages(channel_id, limit, before))
            .await
    }

    async fn soft_delete_message(
        &self,
        id: MessageId,
        sender_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_db(move |db| db.soft_delete_message(id, sender_id, at))
            .await
    }

    async fn add_reaction(&self, message_id: MessageId, user_id: UserId, emoji: String) -> Result<bool> {
        self.with_db(move |db| db.add_reaction(message_id, user_id, &emoji))
            .await
    }

    async fn remove_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
    ) -> Result<bool> {
        self.with_db(move |db| db.remove_reaction(message_id, user_id, &emoji))
            .await
    }

    async fn reactions_for(&self, message_id: MessageId) -> Result<Vec<ReactionSummary>> {
        self.with_db(move |db| db.summarize_reactions(message_id))
            .await
    }

    async fn read_receipts_for(&self, message_id: MessageId) -> Result<Vec<ReadReceipt>> {
        self.with_db(move |db| db.get_read_receipts(message_id))
            .await
    }

    async fn mark_channel_read(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        self.with_db(move |db| db.mark_channel_read(channel_id, user_id, at))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_shared::types::ChannelKind;

    #[tokio::test]
    async fn test_store_round_trip_through_blocking_pool() {
        let store = SqliteStore::open_in_memory().unwrap();
        let alice = UserId::new();

        let channel = store
            .with_db(move |db| {
                db.upsert_user(&User::new(alice, "alice"))?;
                db.create_channel("general", ChannelKind::Public, alice, &[])
            })
            .await
            .unwrap();

        let message = Message::new(channel.id, alice, "hello");
        store.insert_message(message.clone()).await.unwrap();

        let loaded = store.get_message(message.id).await.unwrap();
        assert_eq!(loaded, Some(message));
        assert_eq!(store.get_message(MessageId::new()).await.unwrap(), None);
        assert_eq!(store.get_user(UserId::new()).await.unwrap(), None);
    }
}
