//! WebSocket transport.
//!
//! Each socket gets a reader loop feeding the hub and a writer task draining
//! the connection's bounded outbound queue. The upgrade is refused with 401
//! before any socket exists when the session token does not verify.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use murmur_shared::protocol::ClientEvent;

use crate::api::{bearer_token, AppState};
use crate::auth::Identity;
use crate::error::ServerError;
use crate::hub::Hub;
use crate::registry::Registration;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// `GET /ws?token=...` (or `Authorization: Bearer ...`).
pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let token = query
        .token
        .as_deref()
        .or_else(|| bearer_token(&headers));

    let identity = state.hub.authenticate(token).await.map_err(|e| {
        warn!(error = %e, "WebSocket connection refused");
        e
    })?;

    let hub = state.hub.clone();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, hub, identity)))
}

async fn handle_socket(socket: WebSocket, hub: Hub, identity: Identity) {
    let user_id = identity.user_id;
    let Registration {
        id,
        mut outbound,
        overflow,
        ..
    } = hub.connect(identity).await;

    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let text = match event.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(conn = %id, error = %e, event = event.name(), "Failed to encode event");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match ClientEvent::from_json(&text) {
                    Ok(event) => hub.handle(id, event).await,
                    Err(e) => hub.reject_frame(id, &text, e).await,
                },
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn = %id, error = %e, "WebSocket read error");
                    break;
                }
            },
            _ = overflow.notified() => {
                warn!(conn = %id, user = %user_id, "Closing connection after outbound overflow");
                break;
            }
        }
    }

    hub.disconnect(id).await;
    writer.abort();
    info!(conn = %id, user = %user_id, "WebSocket closed");
}
