//! Presence tracking.
//!
//! A user is online while at least one of their connections is live. Status
//! changes are persisted and then broadcast to every connection.
//!
//! Connection-driven transitions for one user run one at a time, and each
//! re-reads the registry once it holds the user's lock. A reconnect that
//! lands while an offline write is in flight therefore queues behind it and
//! is announced last.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use murmur_shared::protocol::{ServerEvent, StatusChanged};
use murmur_shared::types::{PresenceStatus, UserId};
use murmur_store::ChatStore;

use crate::auth::Identity;
use crate::error::ServerError;
use crate::registry::{ConnectionId, ConnectionRegistry, Skip};

#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn ChatStore>,
    registry: ConnectionRegistry,
    /// Delay before a user whose last connection closed is reported offline.
    grace: Duration,
    pending_offline: Arc<Mutex<HashMap<UserId, JoinHandle<()>>>>,
    transitions: Arc<Mutex<HashMap<UserId, Arc<Mutex<()>>>>>,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn ChatStore>, registry: ConnectionRegistry, grace: Duration) -> Self {
        Self {
            store,
            registry,
            grace,
            pending_offline: Arc::new(Mutex::new(HashMap::new())),
            transitions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// User-requested status change. Nothing is broadcast unless the new
    /// status was stored.
    pub async fn set_status(
        &self,
        identity: &Identity,
        status: PresenceStatus,
    ) -> Result<StatusChanged, ServerError> {
        let now = Utc::now();
        self.store
            .set_user_status(identity.user_id, status, now)
            .await
            .map_err(|e| {
                error!(error = %e, user = %identity.user_id, "Failed to persist status");
                ServerError::from(e)
            })?;

        let changed = status_changed(identity, status, now);
        self.registry
            .broadcast_all(ServerEvent::StatusChanged(changed.clone()), Skip::Nobody)
            .await;
        Ok(changed)
    }

    /// A connection of `identity` was registered.
    ///
    /// Cancels a pending offline report. Only the user's first connection
    /// announces `online`; a reconnect inside the grace window was never
    /// reported offline and stays silent.
    pub async fn connected(&self, identity: &Identity, conn: ConnectionId, first_for_user: bool) {
        let cancelled = match self.pending_offline.lock().await.remove(&identity.user_id) {
            Some(pending) => {
                pending.abort();
                debug!(user = %identity.user_id, "Reconnected within offline grace");
                true
            }
            None => false,
        };

        if first_for_user && !cancelled {
            self.transition(identity, PresenceStatus::Online, Skip::Connection(conn))
                .await;
        }
    }

    /// The user's last connection closed.
    pub async fn last_connection_closed(&self, identity: Identity) {
        if self.grace.is_zero() {
            self.transition(&identity, PresenceStatus::Offline, Skip::User(identity.user_id))
                .await;
            return;
        }

        let user_id = identity.user_id;
        let tracker = self.clone();
        let mut pending = self.pending_offline.lock().await;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(tracker.grace).await;
            tracker.pending_offline.lock().await.remove(&user_id);
            if tracker.registry.is_online(user_id).await {
                return;
            }
            tracker
                .transition(&identity, PresenceStatus::Offline, Skip::User(user_id))
                .await;
        });
        if let Some(previous) = pending.insert(user_id, handle) {
            previous.abort();
        }
    }

    /// Connection-driven transition. A failed write is logged and the
    /// broadcast still goes out, since the connection state already changed.
    async fn transition(&self, identity: &Identity, status: PresenceStatus, skip: Skip) {
        let user_id = identity.user_id;
        let lock = self
            .transitions
            .lock()
            .await
            .entry(user_id)
            .or_default()
            .clone();
        let guard = lock.lock().await;

        let online = self.registry.is_online(user_id).await;
        if online != (status != PresenceStatus::Offline) {
            debug!(user = %user_id, %status, "Presence transition superseded");
        } else {
            self.apply_transition(identity, status, skip).await;
        }

        drop(guard);
        let mut transitions = self.transitions.lock().await;
        // the map and this function hold the only references
        if Arc::strong_count(&lock) == 2 {
            transitions.remove(&user_id);
        }
    }

    async fn apply_transition(&self, identity: &Identity, status: PresenceStatus, skip: Skip) {
        let now = Utc::now();
        if let Err(e) = self.store.set_user_status(identity.user_id, status, now).await {
            error!(error = %e, user = %identity.user_id, %status, "Failed to persist presence");
        }

        info!(user = %identity.user_id, %status, "Presence changed");
        self.registry
            .broadcast_all(
                ServerEvent::StatusChanged(status_changed(identity, status, now)),
                skip,
            )
            .await;
    }
}

fn status_changed(
    identity: &Identity,
    status: PresenceStatus,
    at: chrono::DateTime<Utc>,
) -> StatusChanged {
    StatusChanged {
        user_id: identity.user_id,
        display_name: Some(identity.display_name.clone()),
        status,
        last_seen: at,
    }
}
