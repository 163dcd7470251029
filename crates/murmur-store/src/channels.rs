//! CRUD operations for [`Channel`] records and their member sets.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use murmur_shared::types::{ChannelId, ChannelKind, MemberRole, UserId};

use crate::database::{enum_at, ts_at, uuid_at, Database};
use crate::error::{Result, StoreError};
use crate::models::{Channel, ChannelMember};

/// Longest allowed channel name, in characters.
pub const MAX_CHANNEL_NAME_LEN: usize = 50;

const CHANNEL_COLUMNS: &str = "id, name, kind, is_active, created_by, created_at";

fn direct_key(a: &UserId, b: &UserId) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Create a channel with `created_by` as admin and `others` as members.
    ///
    /// Enforces the naming invariants: non-direct names are unique
    /// (case-insensitively) among active non-direct channels, and a direct
    /// channel has exactly two distinct members and is unique per pair.
    pub fn create_channel(
        &self,
        name: &str,
        kind: ChannelKind,
        created_by: UserId,
        others: &[UserId],
    ) -> Result<Channel> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_CHANNEL_NAME_LEN {
            return Err(StoreError::Invalid(format!(
                "channel name must be 1..={MAX_CHANNEL_NAME_LEN} characters"
            )));
        }

        let mut member_ids = vec![created_by];
        for id in others {
            if !member_ids.contains(id) {
                member_ids.push(*id);
            }
        }

        let name_key = name.to_lowercase();
        let pair_key = match kind {
            ChannelKind::Direct => {
                if member_ids.len() != 2 {
                    return Err(StoreError::Invalid(
                        "a direct channel needs exactly two distinct members".into(),
                    ));
                }
                Some(direct_key(&member_ids[0], &member_ids[1]))
            }
            _ => None,
        };

        let tx = self.conn().unchecked_transaction()?;

        match &pair_key {
            Some(key) => {
                let exists: Option<i64> = tx
                    .query_row(
                        "SELECT 1 FROM channels
                         WHERE kind = 'direct' AND is_active = 1 AND direct_key = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()?;
                if exists.is_some() {
                    return Err(StoreError::DuplicateDirectChannel);
                }
            }
            None => {
                let exists: Option<i64> = tx
                    .query_row(
                        "SELECT 1 FROM channels
                         WHERE kind != 'direct' AND is_active = 1 AND name_key = ?1",
                        params![name_key],
                        |row| row.get(0),
                    )
                    .optional()?;
                if exists.is_some() {
                    return Err(StoreError::DuplicateChannelName(name.to_string()));
                }
            }
        }

        let id = ChannelId::new();
        let now = Utc::now();

        tx.execute(
            "INSERT INTO channels (id, name, name_key, kind, direct_key, is_active, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7)",
            params![
                id.to_string(),
                name,
                name_key,
                kind.as_str(),
                pair_key,
                created_by.to_string(),
                now.to_rfc3339(),
            ],
        )?;

        let mut members = Vec::with_capacity(member_ids.len());
        for user_id in member_ids {
            let role = if user_id == created_by {
                MemberRole::Admin
            } else {
                MemberRole::Member
            };
            tx.execute(
                "INSERT INTO channel_members (channel_id, user_id, role, joined_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id.to_string(), user_id.to_string(), role.as_str(), now.to_rfc3339()],
            )?;
            members.push(ChannelMember {
                user_id,
                role,
                joined_at: now,
            });
        }

        tx.commit()?;

        tracing::debug!(channel = %id, kind = kind.as_str(), "channel created");

        Ok(Channel {
            id,
            name: name.to_string(),
            kind,
            is_active: true,
            created_by,
            created_at: now,
            members,
        })
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single channel with its member set.
    pub fn get_channel(&self, id: ChannelId) -> Result<Channel> {
        let mut channel = self
            .conn()
            .query_row(
                &format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?1"),
                params![id.to_string()],
                row_to_channel,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })?;
        channel.members = self.get_members(id)?;
        Ok(channel)
    }

    pub fn get_members(&self, channel_id: ChannelId) -> Result<Vec<ChannelMember>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id, role, joined_at
             FROM channel_members
             WHERE channel_id = ?1
             ORDER BY joined_at ASC, rowid ASC",
        )?;

        let rows = stmt.query_map(params![channel_id.to_string()], |row| {
            Ok(ChannelMember {
                user_id: UserId(uuid_at(row, 0)?),
                role: enum_at(row, 1, MemberRole::parse)?,
                joined_at: ts_at(row, 2)?,
            })
        })?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }

    /// Active channels the user belongs to, oldest first.
    pub fn list_channels_for_user(&self, user_id: UserId) -> Result<Vec<Channel>> {
        let mut stmt = self.conn().prepare(
            "SELECT c.id, c.name, c.kind, c.is_active, c.created_by, c.created_at
             FROM channels c
             JOIN channel_members m ON m.channel_id = c.id
             WHERE m.user_id = ?1 AND c.is_active = 1
             ORDER BY c.created_at ASC",
        )?;

        let rows = stmt.query_map(params![user_id.to_string()], row_to_channel)?;

        let mut channels = Vec::new();
        for row in rows {
            let mut channel = row?;
            channel.members = self.get_members(channel.id)?;
            channels.push(channel);
        }
        Ok(channels)
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Add a member. Returns `false` if they were already in the channel.
    pub fn add_member(&self, channel_id: ChannelId, user_id: UserId, role: MemberRole) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO channel_members (channel_id, user_id, role, joined_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                channel_id.to_string(),
                user_id.to_string(),
                role.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(affected > 0)
    }

    /// Remove a member; the channel is soft-deactivated once nobody is left.
    pub fn remove_member(&self, channel_id: ChannelId, user_id: UserId) -> Result<bool> {
        let tx = self.conn().unchecked_transaction()?;
        let affected = tx.execute(
            "DELETE FROM channel_members WHERE channel_id = ?1 AND user_id = ?2",
            params![channel_id.to_string(), user_id.to_string()],
        )?;

        let remaining: i64 = tx.query_row(
            "SELECT COUNT(*) FROM channel_members WHERE channel_id = ?1",
            params![channel_id.to_string()],
            |row| row.get(0),
        )?;
        if remaining == 0 {
            tx.execute(
                "UPDATE channels SET is_active = 0 WHERE id = ?1",
                params![channel_id.to_string()],
            )?;
            tracing::debug!(channel = %channel_id, "channel deactivated (no members left)");
        }

        tx.commit()?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a row of `CHANNEL_COLUMNS` to a [`Channel`] without members.
fn row_to_channel(row: &rusqlite::Row<'_>) -> rusqlite::Result<Channel> {
    let is_active: i64 = row.get(3)?;
    Ok(Channel {
        id: ChannelId(uuid_at(row, 0)?),
        name: row.get(1)?,
        kind: enum_at(row, 2, ChannelKind::parse)?,
        is_active: is_active != 0,
        created_by: UserId(uuid_at(row, 4)?),
        created_at: ts_at(row, 5)?,
        members: Vec::new(),
    })
}
