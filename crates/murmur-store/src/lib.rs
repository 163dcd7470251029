//! # murmur-store
//!
//! Persistent storage for murmur, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` with typed CRUD helpers for every domain model,
//! and the async [`ChatStore`] trait the real-time server is written against.

pub mod channels;
pub mod chat_store;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod reactions;
pub mod users;

mod error;

pub use chat_store::{ChatStore, SqliteStore};
pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
