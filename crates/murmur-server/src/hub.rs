//! The real-time hub: one injected service object owning the registry and
//! the services built on it. Transports hand it authenticated connections
//! and decoded client events; it never touches sockets itself.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info};

use murmur_shared::constants::HISTORY_PAGE_MAX;
use murmur_shared::protocol::{
    ClientEvent, Delivered, MemberEvent, MessageView, MessagesRead, ServerEvent,
};
use murmur_shared::types::{ChannelId, MessageId};
use murmur_shared::ProtocolError;
use murmur_store::ChatStore;

use crate::auth::{Identity, SessionVerifier};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::gate::MembershipGate;
use crate::pipeline::MessagePipeline;
use crate::presence::PresenceTracker;
use crate::registry::{ConnectionId, ConnectionRegistry, Registration, Skip};
use crate::typing::TypingManager;

/// One history page. `has_more` is judged against the page size actually
/// used, after clamping.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub messages: Vec<MessageView>,
    pub has_more: bool,
}

#[derive(Clone)]
pub struct Hub {
    store: Arc<dyn ChatStore>,
    sessions: SessionVerifier,
    registry: ConnectionRegistry,
    gate: MembershipGate,
    presence: PresenceTracker,
    typing: TypingManager,
    pipeline: MessagePipeline,
    history_page_limit: u32,
}

impl Hub {
    pub fn new(store: Arc<dyn ChatStore>, config: &ServerConfig) -> Self {
        let registry = ConnectionRegistry::new(config.outbound_queue);
        let gate = MembershipGate::new(store.clone());

        Self {
            sessions: SessionVerifier::new(config.session_pubkey, store.clone()),
            presence: PresenceTracker::new(store.clone(), registry.clone(), config.offline_grace),
            typing: TypingManager::new(registry.clone(), config.typing_timeout),
            pipeline: MessagePipeline::new(
                store.clone(),
                gate.clone(),
                registry.clone(),
                config.max_message_len,
            ),
            history_page_limit: config.history_page_limit,
            store,
            registry,
            gate,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub async fn authenticate(&self, token: Option<&str>) -> Result<Identity, ServerError> {
        self.sessions.authenticate(token).await
    }

    /// Register an authenticated connection, subscribe it to every active
    /// channel its user belongs to and announce the user online.
    pub async fn connect(&self, identity: Identity) -> Registration {
        let registration = self.registry.register(identity.clone()).await;

        match self.store.channels_for_user(identity.user_id).await {
            Ok(channels) => {
                for channel in &channels {
                    self.registry.join_room(registration.id, channel.id).await;
                }
                debug!(conn = %registration.id, rooms = channels.len(), "Auto-joined channels");
            }
            Err(e) => {
                error!(error = %e, user = %identity.user_id, "Failed to load channels on connect");
            }
        }

        self.presence
            .connected(&identity, registration.id, registration.first_for_user)
            .await;

        info!(conn = %registration.id, user = %identity.user_id, "User connected");
        registration
    }

    /// Tear down a connection: stop the user's typing signals and, when it
    /// was their last connection, report them offline.
    pub async fn disconnect(&self, conn: ConnectionId) {
        let Some(gone) = self.registry.unregister(conn).await else {
            return;
        };

        let stopped = self.typing.stop_all(gone.identity.user_id).await;
        if stopped > 0 {
            debug!(conn = %conn, stopped, "Cleared typing signals on disconnect");
        }

        if gone.last_for_user {
            self.presence.last_connection_closed(gone.identity.clone()).await;
        }
        info!(
            conn = %conn,
            user = %gone.identity.user_id,
            rooms = gone.rooms.len(),
            "User disconnected"
        );
    }

    /// Handle one client event. Failures go back to the originating
    /// connection as an `error` event.
    pub async fn handle(&self, conn: ConnectionId, event: ClientEvent) {
        let Some(identity) = self.registry.identity_of(conn).await else {
            debug!(conn = %conn, "Event from unregistered connection");
            return;
        };

        let client_temp_id = match &event {
            ClientEvent::SendMessage(send) => send.client_temp_id.clone(),
            _ => None,
        };

        if let Err(err) = self.dispatch(conn, &identity, event).await {
            match &err {
                ServerError::Internal(detail) => {
                    error!(conn = %conn, user = %identity.user_id, detail = %detail, "Event failed");
                }
                other => {
                    debug!(conn = %conn, user = %identity.user_id, error = %other, "Event rejected");
                }
            }
            self.registry.send_to(conn, err.into_event(client_temp_id)).await;
        }
    }

    /// Report a frame that could not be decoded. The connection stays open.
    /// A rejected `send-message` still carries its temp id when one can be
    /// read from the raw frame.
    pub async fn reject_frame(&self, conn: ConnectionId, raw: &str, err: ProtocolError) {
        debug!(conn = %conn, error = %err, "Malformed client frame");
        let client_temp_id = ClientEvent::salvage_temp_id(raw);
        self.registry
            .send_to(conn, ServerError::from(err).into_event(client_temp_id))
            .await;
    }

    async fn dispatch(
        &self,
        conn: ConnectionId,
        identity: &Identity,
        event: ClientEvent,
    ) -> Result<(), ServerError> {
        match event {
            ClientEvent::JoinChannel(r) => self.join(conn, identity, r.channel_id).await,
            ClientEvent::LeaveChannel(r) => {
                self.leave(conn, identity, r.channel_id).await;
                Ok(())
            }
            ClientEvent::SendMessage(request) => {
                let channel_id = request.channel_id;
                let client_temp_id = request.client_temp_id.clone();
                let view = self.pipeline.send(identity, request).await?;

                self.registry
                    .send_to(
                        conn,
                        ServerEvent::MessageDelivered(Delivered {
                            client_temp_id,
                            message_id: view.id,
                        }),
                    )
                    .await;
                self.typing.stop(identity.user_id, channel_id).await;
                Ok(())
            }
            ClientEvent::TypingStart(r) => {
                self.gate.authorize(identity.user_id, r.channel_id).await?;
                self.typing.start(identity, r.channel_id).await;
                Ok(())
            }
            ClientEvent::TypingStop(r) => {
                self.typing.stop(identity.user_id, r.channel_id).await;
                Ok(())
            }
            ClientEvent::AddReaction(r) => {
                self.pipeline
                    .add_reaction(identity, r.message_id, r.emoji)
                    .await?;
                Ok(())
            }
            ClientEvent::RemoveReaction(r) => {
                self.pipeline
                    .remove_reaction(identity, r.message_id, r.emoji)
                    .await?;
                Ok(())
            }
            ClientEvent::DeleteMessage(r) => {
                self.pipeline.delete(identity, r.message_id).await?;
                Ok(())
            }
            ClientEvent::MarkRead(r) => {
                self.pipeline
                    .mark_read(identity, r.channel_id, Skip::Connection(conn))
                    .await?;
                Ok(())
            }
            ClientEvent::UpdateStatus(s) => {
                self.presence.set_status(identity, s.status).await?;
                Ok(())
            }
        }
    }

    async fn join(&self, conn: ConnectionId, identity: &Identity, channel_id: ChannelId) -> Result<(), ServerError> {
        self.gate.authorize(identity.user_id, channel_id).await?;

        if self.registry.join_room(conn, channel_id).await {
            self.registry
                .broadcast_room(
                    channel_id,
                    ServerEvent::MemberJoined(member_event(identity, channel_id)),
                    Skip::Connection(conn),
                )
                .await;
        }
        Ok(())
    }

    async fn leave(&self, conn: ConnectionId, identity: &Identity, channel_id: ChannelId) {
        if !self.registry.leave_room(conn, channel_id).await {
            return;
        }
        self.registry
            .broadcast_room(
                channel_id,
                ServerEvent::MemberLeft(member_event(identity, channel_id)),
                Skip::Connection(conn),
            )
            .await;
    }

    // ------------------------------------------------------------------
    // Request/response operations used by the HTTP API
    // ------------------------------------------------------------------

    pub async fn history(
        &self,
        identity: &Identity,
        channel_id: ChannelId,
        limit: Option<u32>,
        before: Option<MessageId>,
    ) -> Result<HistoryPage, ServerError> {
        let limit = limit
            .unwrap_or(self.history_page_limit)
            .clamp(1, HISTORY_PAGE_MAX);
        let messages = self.pipeline.history(identity, channel_id, limit, before).await?;
        let has_more = messages.len() as u32 >= limit;

        // the reader's open sessions clear their unread state
        self.registry
            .send_to_user(
                identity.user_id,
                ServerEvent::MessagesRead(MessagesRead {
                    channel_id,
                    user_id: identity.user_id,
                    read_at: Utc::now(),
                }),
            )
            .await;
        Ok(HistoryPage { messages, has_more })
    }

    pub async fn delete_message(&self, identity: &Identity, message_id: MessageId) -> Result<(), ServerError> {
        self.pipeline.delete(identity, message_id).await?;
        Ok(())
    }
}

fn member_event(identity: &Identity, channel_id: ChannelId) -> MemberEvent {
    MemberEvent {
        channel_id,
        user_id: identity.user_id,
        display_name: Some(identity.display_name.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use murmur_shared::protocol::{
        ChannelRef, ErrorKind, ReactionRef, SendMessage, StatusUpdate,
    };
    use murmur_shared::types::{ChannelKind, PresenceStatus, UserId};
    use murmur_store::{Message, SqliteStore, User};
    use tokio::sync::mpsc;

    struct World {
        hub: Hub,
        store: SqliteStore,
        x: Identity,
        y: Identity,
        z: Identity,
        /// X and Z are members.
        g: ChannelId,
        /// X and Z are members.
        h: ChannelId,
        /// Private channel of Z only.
        p: ChannelId,
    }

    async fn world() -> World {
        let store = SqliteStore::open_in_memory().unwrap();
        let x = Identity { user_id: UserId::new(), display_name: "xavier".into() };
        let y = Identity { user_id: UserId::new(), display_name: "yasmin".into() };
        let z = Identity { user_id: UserId::new(), display_name: "zora".into() };

        let (xi, yi, zi) = (x.user_id, y.user_id, z.user_id);
        let (g, h, p) = store
            .with_db(move |db| {
                db.upsert_user(&User::new(xi, "xavier"))?;
                db.upsert_user(&User::new(yi, "yasmin"))?;
                db.upsert_user(&User::new(zi, "zora"))?;
                let g = db.create_channel("general", ChannelKind::Public, xi, &[zi])?;
                let h = db.create_channel("hallway", ChannelKind::Public, zi, &[xi])?;
                let p = db.create_channel("private", ChannelKind::Private, zi, &[])?;
                Ok((g.id, h.id, p.id))
            })
            .await
            .unwrap();

        let hub = Hub::new(Arc::new(store.clone()), &ServerConfig::default());
        World { hub, store, x, y, z, g, h, p }
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn send(channel_id: ChannelId, content: &str, temp: &str) -> ClientEvent {
        ClientEvent::SendMessage(SendMessage {
            channel_id,
            content: content.into(),
            reply_to: None,
            client_temp_id: Some(temp.into()),
        })
    }

    #[tokio::test]
    async fn scenario_send_is_acked_and_broadcast() {
        let w = world().await;
        let mut x_conn = w.hub.connect(w.x.clone()).await;
        let mut z_conn = w.hub.connect(w.z.clone()).await;
        drain(&mut x_conn.outbound);
        drain(&mut z_conn.outbound);

        w.hub.handle(x_conn.id, send(w.g, "hello", "t1")).await;

        let x_events = drain(&mut x_conn.outbound);
        let broadcast_id = x_events.iter().find_map(|e| match e {
            ServerEvent::NewMessage(view) => Some(view.id),
            _ => None,
        });
        let acked_id = x_events.iter().find_map(|e| match e {
            ServerEvent::MessageDelivered(d) if d.client_temp_id.as_deref() == Some("t1") => {
                Some(d.message_id)
            }
            _ => None,
        });
        assert!(acked_id.is_some());
        assert_eq!(broadcast_id, acked_id);

        let z_events = drain(&mut z_conn.outbound);
        assert!(z_events.iter().any(|e| matches!(
            e,
            ServerEvent::NewMessage(view) if Some(view.id) == acked_id && view.content == "hello"
        )));
        // only the sender gets the ack
        assert!(!z_events.iter().any(|e| matches!(e, ServerEvent::MessageDelivered(_))));
    }

    #[tokio::test]
    async fn scenario_non_member_send_is_denied() {
        let w = world().await;
        let mut y_conn = w.hub.connect(w.y.clone()).await;
        drain(&mut y_conn.outbound);

        w.hub.handle(y_conn.id, send(w.p, "sneaky", "t9")).await;

        let events = drain(&mut y_conn.outbound);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::Error(e) => {
                assert_eq!(e.kind, ErrorKind::AccessDenied);
                assert_eq!(e.client_temp_id.as_deref(), Some("t9"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(w.store.list_messages(w.p, 50, None).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_typing_expires_on_its_own() {
        let w = world().await;
        let x_conn = w.hub.connect(w.x.clone()).await;
        let mut z_conn = w.hub.connect(w.z.clone()).await;
        drain(&mut z_conn.outbound);

        w.hub
            .handle(x_conn.id, ClientEvent::TypingStart(ChannelRef { channel_id: w.g }))
            .await;

        tokio::time::sleep(Duration::from_millis(1900)).await;
        let early = drain(&mut z_conn.outbound);
        assert_eq!(early.len(), 1);
        assert!(matches!(early[0], ServerEvent::TypingStarted(_)));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let late = drain(&mut z_conn.outbound);
        assert_eq!(late.len(), 1);
        assert!(matches!(
            &late[0],
            ServerEvent::TypingStopped(s) if s.user_id == w.x.user_id && s.channel_id == w.g
        ));
    }

    #[tokio::test]
    async fn scenario_disconnect_while_typing() {
        let w = world().await;
        let x_conn = w.hub.connect(w.x.clone()).await;
        let mut z_conn = w.hub.connect(w.z.clone()).await;
        drain(&mut z_conn.outbound);

        for channel_id in [w.g, w.h] {
            w.hub
                .handle(x_conn.id, ClientEvent::TypingStart(ChannelRef { channel_id }))
                .await;
        }
        drain(&mut z_conn.outbound);

        w.hub.disconnect(x_conn.id).await;

        let events = drain(&mut z_conn.outbound);
        let mut stopped: Vec<ChannelId> = events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::TypingStopped(s) if s.user_id == w.x.user_id => Some(s.channel_id),
                _ => None,
            })
            .collect();
        stopped.sort();
        let mut expected = vec![w.g, w.h];
        expected.sort();
        assert_eq!(stopped, expected);

        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::StatusChanged(s) if s.user_id == w.x.user_id && s.status == PresenceStatus::Offline
        )));
    }

    #[tokio::test]
    async fn test_offline_waits_for_last_connection() {
        let w = world().await;
        let first = w.hub.connect(w.x.clone()).await;
        let second = w.hub.connect(w.x.clone()).await;
        let mut z_conn = w.hub.connect(w.z.clone()).await;
        drain(&mut z_conn.outbound);

        let offline = |events: &[ServerEvent]| {
            events.iter().any(|e| matches!(
                e,
                ServerEvent::StatusChanged(s) if s.status == PresenceStatus::Offline
            ))
        };

        w.hub.disconnect(first.id).await;
        assert!(!offline(&drain(&mut z_conn.outbound)));

        w.hub.disconnect(second.id).await;
        assert!(offline(&drain(&mut z_conn.outbound)));
    }

    #[tokio::test]
    async fn test_connect_auto_joins_and_announces() {
        let w = world().await;
        let mut z_conn = w.hub.connect(w.z.clone()).await;
        drain(&mut z_conn.outbound);

        let x_conn = w.hub.connect(w.x.clone()).await;

        assert!(w.hub.registry().room_members(w.g).await.contains(&x_conn.id));
        assert!(w.hub.registry().room_members(w.h).await.contains(&x_conn.id));
        assert!(!w.hub.registry().room_members(w.p).await.contains(&x_conn.id));

        let events = drain(&mut z_conn.outbound);
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::StatusChanged(s) if s.user_id == w.x.user_id && s.status == PresenceStatus::Online
        )));
    }

    #[tokio::test]
    async fn test_join_denied_and_leave_notifies() {
        let w = world().await;
        let mut y_conn = w.hub.connect(w.y.clone()).await;
        let x_conn = w.hub.connect(w.x.clone()).await;
        let mut z_conn = w.hub.connect(w.z.clone()).await;
        drain(&mut y_conn.outbound);
        drain(&mut z_conn.outbound);

        w.hub
            .handle(y_conn.id, ClientEvent::JoinChannel(ChannelRef { channel_id: w.p }))
            .await;
        assert!(matches!(
            drain(&mut y_conn.outbound).as_slice(),
            [ServerEvent::Error(e)] if e.kind == ErrorKind::AccessDenied
        ));

        w.hub
            .handle(x_conn.id, ClientEvent::LeaveChannel(ChannelRef { channel_id: w.g }))
            .await;
        assert!(drain(&mut z_conn.outbound)
            .iter()
            .any(|e| matches!(e, ServerEvent::MemberLeft(m) if m.user_id == w.x.user_id)));

        // leaving again is a silent no-op
        w.hub
            .handle(x_conn.id, ClientEvent::LeaveChannel(ChannelRef { channel_id: w.g }))
            .await;
        assert!(drain(&mut z_conn.outbound).is_empty());

        w.hub
            .handle(x_conn.id, ClientEvent::JoinChannel(ChannelRef { channel_id: w.g }))
            .await;
        assert!(drain(&mut z_conn.outbound)
            .iter()
            .any(|e| matches!(e, ServerEvent::MemberJoined(m) if m.user_id == w.x.user_id)));
    }

    #[tokio::test]
    async fn test_reaction_and_status_events() {
        let w = world().await;
        let mut x_conn = w.hub.connect(w.x.clone()).await;
        let mut z_conn = w.hub.connect(w.z.clone()).await;

        w.hub.handle(x_conn.id, send(w.g, "react to this", "t2")).await;
        let message_id = drain(&mut x_conn.outbound)
            .into_iter()
            .find_map(|e| match e {
                ServerEvent::MessageDelivered(d) => Some(d.message_id),
                _ => None,
            })
            .unwrap();
        drain(&mut z_conn.outbound);

        w.hub
            .handle(
                z_conn.id,
                ClientEvent::AddReaction(ReactionRef { message_id, emoji: "🎉".into() }),
            )
            .await;
        assert!(drain(&mut x_conn.outbound).iter().any(|e| matches!(
            e,
            ServerEvent::MessageUpdated(view) if view.reactions.len() == 1
        )));

        w.hub
            .handle(
                z_conn.id,
                ClientEvent::UpdateStatus(StatusUpdate { status: PresenceStatus::Away }),
            )
            .await;
        assert!(drain(&mut x_conn.outbound).iter().any(|e| matches!(
            e,
            ServerEvent::StatusChanged(s) if s.user_id == w.z.user_id && s.status == PresenceStatus::Away
        )));
    }

    #[tokio::test]
    async fn test_malformed_frame_reports_validation_error() {
        let w = world().await;
        let mut x_conn = w.hub.connect(w.x.clone()).await;
        drain(&mut x_conn.outbound);

        let raw = "{\"type\":\"send-message\"}";
        let err = ClientEvent::from_json(raw).unwrap_err();
        w.hub.reject_frame(x_conn.id, raw, err).await;

        assert!(matches!(
            drain(&mut x_conn.outbound).as_slice(),
            [ServerEvent::Error(e)] if e.kind == ErrorKind::ValidationFailed && e.client_temp_id.is_none()
        ));
        assert_eq!(w.hub.registry().connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_undecodable_send_is_rejected_with_temp_id() {
        let w = world().await;
        let mut x_conn = w.hub.connect(w.x.clone()).await;
        drain(&mut x_conn.outbound);

        let raw = r#"{"type":"send-message","data":{"channelId":"nope","content":"hi","clientTempId":"tmp-9"}}"#;
        let err = ClientEvent::from_json(raw).unwrap_err();
        w.hub.reject_frame(x_conn.id, raw, err).await;

        match drain(&mut x_conn.outbound).as_slice() {
            [ServerEvent::Error(e)] => {
                assert_eq!(e.kind, ErrorKind::ValidationFailed);
                assert_eq!(e.client_temp_id.as_deref(), Some("tmp-9"));
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_history_page_limit_is_clamped() {
        let w = world().await;
        let x_conn = w.hub.connect(w.x.clone()).await;
        for i in 0..3 {
            w.hub.handle(x_conn.id, send(w.g, &format!("m{i}"), &format!("t{i}"))).await;
        }

        let page = w.hub.history(&w.z, w.g, Some(0), None).await.unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].content, "m2");
        assert!(page.has_more);

        let all = w.hub.history(&w.z, w.g, None, None).await.unwrap();
        assert_eq!(all.messages.len(), 3);
        assert!(!all.has_more);
    }

    #[tokio::test]
    async fn test_history_has_more_above_max_page() {
        let w = world().await;
        let (g, x) = (w.g, w.x.user_id);
        w.store
            .with_db(move |db| {
                for i in 0..250 {
                    db.insert_message(&Message::new(g, x, format!("m{i}")))?;
                }
                Ok(())
            })
            .await
            .unwrap();

        let first = w.hub.history(&w.z, w.g, Some(500), None).await.unwrap();
        assert_eq!(first.messages.len(), HISTORY_PAGE_MAX as usize);
        assert!(first.has_more);

        let oldest = first.messages[0].id;
        let rest = w.hub.history(&w.z, w.g, Some(500), Some(oldest)).await.unwrap();
        assert_eq!(rest.messages.len(), 50);
        assert!(!rest.has_more);
    }

    #[tokio::test]
    async fn test_history_notifies_readers_sessions() {
        let w = world().await;
        let mut z_conn = w.hub.connect(w.z.clone()).await;
        drain(&mut z_conn.outbound);

        w.hub.history(&w.z, w.g, None, None).await.unwrap();

        assert!(matches!(
            drain(&mut z_conn.outbound).as_slice(),
            [ServerEvent::MessagesRead(r)] if r.user_id == w.z.user_id && r.channel_id == w.g
        ));
    }
}
