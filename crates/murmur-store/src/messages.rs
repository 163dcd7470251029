use chrono::{DateTime, Utc};
use rusqlite::params;

use murmur_shared::types::{ChannelId, MessageId, UserId};

use crate::database::{opt_ts_at, opt_uuid_at, ts_at, uuid_at, Database};
use crate::error::{Result, StoreError};
use crate::models::{Message, ReadReceipt};

const MESSAGE_COLUMNS: &str =
    "id, channel_id, sender_id, content, reply_to, is_system, created_at, deleted_at";

impl Database {
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.conn().execute(
            "INSERT INTO messages (id, channel_id, sender_id, content, reply_to, is_system, created_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.id.to_string(),
                message.channel_id.to_string(),
                message.sender_id.to_string(),
                message.content,
                message.reply_to.map(|r| r.to_string()),
                message.is_system,
                message.created_at.to_rfc3339(),
                message.deleted_at.map(|d| d.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Fetch a message by id, deleted or not.
    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// A page of non-deleted messages in insert order (oldest first).
    ///
    /// Returns the newest `limit` messages, or the newest `limit` older than
    /// `before` when given.
    pub fn list_messages(
        &self,
        channel_id: ChannelId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE channel_id = ?1
               AND deleted_at IS NULL
               AND (?2 IS NULL OR seq < (SELECT seq FROM messages WHERE id = ?2))
             ORDER BY seq DESC
             LIMIT ?3"
        ))?;

        let rows = stmt.query_map(
            params![channel_id.to_string(), before.map(|b| b.to_string()), limit],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    /// Soft-delete a message on behalf of its sender.
    ///
    /// Returns `false` when the message does not exist, is already deleted,
    /// or belongs to someone else.
    pub fn soft_delete_message(
        &self,
        id: MessageId,
        sender_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET deleted_at = ?1
             WHERE id = ?2 AND sender_id = ?3 AND deleted_at IS NULL",
            params![at.to_rfc3339(), id.to_string(), sender_id.to_string()],
        )?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Read receipts
    // ------------------------------------------------------------------

    /// Record a receipt for every message in the channel not authored by
    /// `user_id` and not yet read by them. Returns the number of new receipts.
    pub fn mark_channel_read(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO read_receipts (message_id, user_id, read_at)
             SELECT id, ?2, ?3 FROM messages
             WHERE channel_id = ?1 AND sender_id != ?2 AND deleted_at IS NULL",
            params![channel_id.to_string(), user_id.to_string(), at.to_rfc3339()],
        )?;
        Ok(affected)
    }

    pub fn get_read_receipts(&self, message_id: MessageId) -> Result<Vec<ReadReceipt>> {
        let mut stmt = self.conn().prepare(
            "SELECT message_id, user_id, read_at
             FROM read_receipts WHERE message_id = ?1 ORDER BY read_at ASC",
        )?;

        let rows = stmt.query_map(params![message_id.to_string()], |row| {
            Ok(ReadReceipt {
                message_id: MessageId(uuid_at(row, 0)?),
                user_id: UserId(uuid_at(row, 1)?),
                read_at: ts_at(row, 2)?,
            })
        })?;

        let mut receipts = Vec::new();
        for row in rows {
            receipts.push(row?);
        }
        Ok(receipts)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: MessageId(uuid_at(row, 0)?),
        channel_id: ChannelId(uuid_at(row, 1)?),
        sender_id: UserId(uuid_at(row, 2)?),
        content: row.get(3)?,
        reply_to: opt_uuid_at(row, 4)?.map(MessageId),
        is_system: row.get(5)?,
        created_at: ts_at(row, 6)?,
        deleted_at: opt_ts_at(row, 7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;
    use murmur_shared::types::ChannelKind;

    fn setup() -> (Database, ChannelId, UserId, UserId) {
        let db = Database::open_in_memory().unwrap();
        let alice = UserId::new();
        let bob = UserId::new();
        db.upsert_user(&User::new(alice, "alice")).unwrap();
        db.upsert_user(&User::new(bob, "bob")).unwrap();
        let channel = db
            .create_channel("general", ChannelKind::Public, alice, &[bob])
            .unwrap();
        (db, channel.id, alice, bob)
    }

    #[test]
    fn test_history_follows_insert_order() {
        let (db, channel, alice, bob) = setup();
        let first = Message::new(channel, alice, "one");
        let mut second = Message::new(channel, bob, "two");
        // an earlier wall-clock time must not reorder history
        second.created_at = first.created_at - chrono::Duration::seconds(5);
        db.insert_message(&first).unwrap();
        db.insert_message(&second).unwrap();

        let page = db.list_messages(channel, 50, None).unwrap();
        let contents: Vec<&str> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two"]);
    }

    #[test]
    fn test_history_paging() {
        let (db, channel, alice, _) = setup();
        let ids: Vec<MessageId> = (0..5)
            .map(|i| {
                let m = Message::new(channel, alice, format!("m{i}"));
                db.insert_message(&m).unwrap();
                m.id
            })
            .collect();

        let newest = db.list_messages(channel, 2, None).unwrap();
        assert_eq!(newest.iter().map(|m| m.id).collect::<Vec<_>>(), ids[3..].to_vec());

        let older = db.list_messages(channel, 2, Some(ids[3])).unwrap();
        assert_eq!(older.iter().map(|m| m.id).collect::<Vec<_>>(), ids[1..3].to_vec());
    }

    #[test]
    fn test_soft_delete_sender_only() {
        let (db, channel, alice, bob) = setup();
        let m = Message::new(channel, alice, "secret");
        db.insert_message(&m).unwrap();

        assert!(!db.soft_delete_message(m.id, bob, Utc::now()).unwrap());
        assert!(db.soft_delete_message(m.id, alice, Utc::now()).unwrap());
        assert!(!db.soft_delete_message(m.id, alice, Utc::now()).unwrap());

        assert!(db.get_message(m.id).unwrap().is_deleted());
        assert!(db.list_messages(channel, 50, None).unwrap().is_empty());
    }

    #[test]
    fn test_mark_channel_read_skips_own_and_repeats() {
        let (db, channel, alice, bob) = setup();
        let from_alice = Message::new(channel, alice, "hi bob");
        let from_bob = Message::new(channel, bob, "hi alice");
        db.insert_message(&from_alice).unwrap();
        db.insert_message(&from_bob).unwrap();

        assert_eq!(db.mark_channel_read(channel, bob, Utc::now()).unwrap(), 1);
        assert_eq!(db.mark_channel_read(channel, bob, Utc::now()).unwrap(), 0);

        let receipts = db.get_read_receipts(from_alice.id).unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].user_id, bob);
        assert!(db.get_read_receipts(from_bob.id).unwrap().is_empty());
    }
}
