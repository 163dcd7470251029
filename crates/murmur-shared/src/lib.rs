//! # murmur-shared
//!
//! Types shared by the murmur server and client: identifiers, the real-time
//! wire protocol, and the session token format.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod session;
pub mod types;

pub use error::{ProtocolError, TokenError};
