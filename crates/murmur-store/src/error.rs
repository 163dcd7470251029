use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// An active non-direct channel already uses this name (case-insensitive).
    #[error("Channel name already exists: {0}")]
    DuplicateChannelName(String),

    /// A direct channel for this pair of identities already exists.
    #[error("Direct channel already exists")]
    DuplicateDirectChannel,

    /// Input rejected before touching the database.
    #[error("Invalid record: {0}")]
    Invalid(String),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// The database mutex was poisoned by a panicking writer.
    #[error("Database handle poisoned")]
    Poisoned,

    /// A blocking store task was cancelled or panicked.
    #[error("Store task failed: {0}")]
    Task(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Turn `NotFound` into `Ok(None)`.
pub(crate) fn optional<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(StoreError::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}
