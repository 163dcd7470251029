use chrono::Utc;
use rusqlite::params;

use murmur_shared::types::{MessageId, UserId};

use crate::database::{ts_at, uuid_at, Database};
use crate::error::Result;
use crate::models::{Reaction, ReactionSummary};

impl Database {
    /// Add a reaction. A user contributes at most one reaction per emoji per
    /// message, so re-adding is a no-op and returns `false`.
    pub fn add_reaction(&self, message_id: MessageId, user_id: UserId, emoji: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO reactions (message_id, user_id, emoji, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                message_id.to_string(),
                user_id.to_string(),
                emoji,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn remove_reaction(&self, message_id: MessageId, user_id: UserId, emoji: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
            params![message_id.to_string(), user_id.to_string(), emoji],
        )?;
        Ok(affected > 0)
    }

    pub fn get_reactions_for_message(&self, message_id: MessageId) -> Result<Vec<Reaction>> {
        let mut stmt = self.conn().prepare(
            "SELECT message_id, user_id, emoji, created_at
             FROM reactions WHERE message_id = ?1 ORDER BY rowid ASC",
        )?;

        let rows = stmt.query_map(params![message_id.to_string()], |row| {
            Ok(Reaction {
                message_id: MessageId(uuid_at(row, 0)?),
                user_id: UserId(uuid_at(row, 1)?),
                emoji: row.get(2)?,
                created_at: ts_at(row, 3)?,
            })
        })?;

        let mut reactions = Vec::new();
        for row in rows {
            reactions.push(row?);
        }
        Ok(reactions)
    }

    /// Reactions grouped by emoji, in order of each emoji's first use.
    pub fn summarize_reactions(&self, message_id: MessageId) -> Result<Vec<ReactionSummary>> {
        let mut summaries: Vec<ReactionSummary> = Vec::new();
        for reaction in self.get_reactions_for_message(message_id)? {
            match summaries.iter_mut().find(|s| s.emoji == reaction.emoji) {
                Some(summary) => summary.users.push(reaction.user_id),
                None => summaries.push(ReactionSummary {
                    emoji: reaction.emoji,
                    users: vec![reaction.user_id],
                }),
            }
        }
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Message, User};
    use murmur_shared::types::ChannelKind;

    fn setup() -> (Database, MessageId, UserId, UserId) {
        let db = Database::open_in_memory().unwrap();
        let alice = UserId::new();
        let bob = UserId::new();
        db.upsert_user(&User::new(alice, "alice")).unwrap();
        db.upsert_user(&User::new(bob, "bob")).unwrap();
        let channel = db
            .create_channel("general", ChannelKind::Public, alice, &[bob])
            .unwrap();
        let message = Message::new(channel.id, alice, "react to me");
        db.insert_message(&message).unwrap();
        (db, message.id, alice, bob)
    }

    #[test]
    fn test_reaction_idempotent_per_user() {
        let (db, message, alice, _) = setup();

        assert!(db.add_reaction(message, alice, "👍").unwrap());
        assert!(!db.add_reaction(message, alice, "👍").unwrap());

        let summary = db.summarize_reactions(message).unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].count(), 1);
    }

    #[test]
    fn test_summary_groups_by_emoji() {
        let (db, message, alice, bob) = setup();
        db.add_reaction(message, alice, "👍").unwrap();
        db.add_reaction(message, bob, "🎉").unwrap();
        db.add_reaction(message, bob, "👍").unwrap();

        let summary = db.summarize_reactions(message).unwrap();
        assert_eq!(summary[0].emoji, "👍");
        assert_eq!(summary[0].users, vec![alice, bob]);
        assert_eq!(summary[1].emoji, "🎉");
        assert_eq!(summary[1].count(), 1);
    }

    #[test]
    fn test_remove_reaction() {
        let (db, message, alice, _) = setup();
        db.add_reaction(message, alice, "👍").unwrap();

        assert!(db.remove_reaction(message, alice, "👍").unwrap());
        assert!(!db.remove_reaction(message, alice, "👍").unwrap());
        assert!(db.summarize_reactions(message).unwrap().is_empty());
    }
}
