//! Channel membership checks.
//!
//! Membership is read from the store on every call so a removal takes
//! effect on the next action without any cache invalidation.

use std::sync::Arc;

use tracing::{debug, error};

use murmur_shared::types::{ChannelId, UserId};
use murmur_store::{Channel, ChatStore};

use crate::error::ServerError;

#[derive(Clone)]
pub struct MembershipGate {
    store: Arc<dyn ChatStore>,
}

impl MembershipGate {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    /// Succeeds with the channel when it exists, is active and lists
    /// `user_id` as a member. Every other case is `access-denied`, so a
    /// caller cannot tell a missing channel from a private one.
    pub async fn authorize(&self, user_id: UserId, channel_id: ChannelId) -> Result<Channel, ServerError> {
        let channel = self.store.get_channel(channel_id).await.map_err(|e| {
            error!(error = %e, channel = %channel_id, "Channel lookup failed");
            ServerError::from(e)
        })?;

        match channel {
            Some(channel) if channel.is_active && channel.has_member(&user_id) => Ok(channel),
            Some(_) => {
                debug!(user = %user_id, channel = %channel_id, "Not a member or channel inactive");
                Err(ServerError::access_denied())
            }
            None => {
                debug!(user = %user_id, channel = %channel_id, "Channel does not exist");
                Err(ServerError::access_denied())
            }
        }
    }
}
