//! CRUD operations for [`User`] records.

use chrono::{DateTime, Utc};
use rusqlite::params;

use murmur_shared::types::{PresenceStatus, UserId};

use crate::database::{enum_at, ts_at, uuid_at, Database};
use crate::error::{Result, StoreError};
use crate::models::User;

impl Database {
    /// Insert a user or refresh its display name if it already exists.
    pub fn upsert_user(&self, user: &User) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, display_name, status, last_seen, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name",
            params![
                user.id.to_string(),
                user.display_name,
                user.status.as_str(),
                user.last_seen.to_rfc3339(),
                user.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: UserId) -> Result<User> {
        self.conn()
            .query_row(
                "SELECT id, display_name, status, last_seen, created_at
                 FROM users WHERE id = ?1",
                params![id.to_string()],
                row_to_user,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Update presence. Returns `NotFound` for an unknown user.
    pub fn set_user_status(
        &self,
        id: UserId,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE users SET status = ?1, last_seen = ?2 WHERE id = ?3",
            params![status.as_str(), last_seen.to_rfc3339(), id.to_string()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: UserId(uuid_at(row, 0)?),
        display_name: row.get(1)?,
        status: enum_at(row, 2, PresenceStatus::parse)?,
        last_seen: ts_at(row, 3)?,
        created_at: ts_at(row, 4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_and_status() {
        let db = Database::open_in_memory().unwrap();
        let user = User::new(UserId::new(), "alice");
        db.upsert_user(&user).unwrap();

        let loaded = db.get_user(user.id).unwrap();
        assert_eq!(loaded.display_name, "alice");
        assert_eq!(loaded.status, PresenceStatus::Offline);

        let now = Utc::now();
        db.set_user_status(user.id, PresenceStatus::Busy, now).unwrap();
        assert_eq!(db.get_user(user.id).unwrap().status, PresenceStatus::Busy);

        // upsert keeps the stored status
        db.upsert_user(&User::new(user.id, "alice2")).unwrap();
        let loaded = db.get_user(user.id).unwrap();
        assert_eq!(loaded.display_name, "alice2");
        assert_eq!(loaded.status, PresenceStatus::Busy);
    }

    #[test]
    fn test_unknown_user() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(db.get_user(UserId::new()), Err(StoreError::NotFound)));
        assert!(matches!(
            db.set_user_status(UserId::new(), PresenceStatus::Online, Utc::now()),
            Err(StoreError::NotFound)
        ));
    }
}
