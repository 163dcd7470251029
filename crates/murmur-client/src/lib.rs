//! # murmur-client
//!
//! Transport-agnostic client core: applies server events to a local view of
//! channels, reconciles optimistic sends with the server's ack and echo, and
//! tracks typing and presence.

pub mod error;
pub mod events;
pub mod presence;
pub mod state;
pub mod timeline;
pub mod typing;

pub use error::ClientError;
pub use events::ClientNotice;
pub use state::ClientState;
pub use timeline::{Timeline, TimelineEntry};
