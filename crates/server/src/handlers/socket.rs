//! Real-time socket adapter
//!
//! `GET /ws` upgrades to a WebSocket. The client identifies with
//! `userConnected`, after which it is reachable for push delivery until the
//! socket closes or goes idle.

use crate::config::AppState;
use crate::handlers::auth::bearer_token;
use crate::presence::ConnectionHandle;
use crate::protocol::{ClientEvent, IdentifyPayload, MarkReadPayload, ServerEvent};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

/// GET /ws
///
/// An optional session token (`?token=` or bearer header) pins the
/// connection to that user; without one the `userConnected` payload is taken
/// as given.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = params
        .get("token")
        .map(String::as_str)
        .or_else(|| bearer_token(&headers))
        .map(str::to_string);

    let authenticated = match token {
        Some(token) => match state.identity.resolve_token(&token).await {
            Ok(user) => user,
            Err(e) => {
                warn!("Token lookup for socket failed: {}", e);
                None
            }
        },
        None => None,
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, authenticated))
}

async fn handle_socket(socket: WebSocket, state: AppState, authenticated: Option<String>) {
    let (handle, mut outbound) = ConnectionHandle::channel(state.config.outbound_buffer);
    let connection_id = handle.id();
    info!("Socket {} opened", connection_id);

    let (mut sink, mut stream) = socket.split();
    let heartbeat = state.config.heartbeat_interval;

    // Writer: drain the outbound queue, ping on the heartbeat.
    let writer = tokio::spawn(async move {
        let mut ticker = interval(heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                event = outbound.recv() => {
                    let Some(event) = event else { break };
                    let text = match event.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Dropping unserializable event: {}", e);
                            continue;
                        }
                    };
                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if sink.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    let idle_timeout = state.config.idle_timeout;
    let mut session = SocketSession::new(state, handle, authenticated);

    loop {
        let frame = match timeout(idle_timeout, stream.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                debug!("Socket {} read error: {}", connection_id, e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                info!("Socket {} idle for {:?}, closing", connection_id, idle_timeout);
                break;
            }
        };

        match frame {
            WsMessage::Text(text) => session.handle_text(text.as_str()).await,
            WsMessage::Binary(_) => {
                session
                    .reply(ServerEvent::error("invalid_payload", "binary frames are not supported"))
                    .await
            }
            WsMessage::Close(_) => break,
            // Ping/Pong only refresh the idle timer.
            _ => {}
        }
    }

    if let Some(user) = session.close() {
        info!("{} went offline", user);
    }
    drop(session);
    writer.abort();
    info!("Socket {} closed", connection_id);
}

/// Per-connection event handling, independent of the transport.
pub struct SocketSession {
    state: AppState,
    handle: ConnectionHandle,
    authenticated: Option<String>,
    user_id: Option<String>,
}

impl SocketSession {
    pub fn new(state: AppState, handle: ConnectionHandle, authenticated: Option<String>) -> Self {
        Self {
            state,
            handle,
            authenticated,
            user_id: None,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Malformed frames are answered with an `error` event; nothing propagates.
    pub async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => self.handle_event(event).await,
            Err(e) => {
                debug!("Unparseable frame on {}: {}", self.handle.id(), e);
                self.reply(ServerEvent::error(
                    "invalid_payload",
                    format!("unrecognized event: {}", e),
                ))
                .await;
            }
        }
    }

    pub async fn handle_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::UserConnected(payload) => self.identify(payload).await,
            ClientEvent::SendMessage(input) => {
                let Some(sender) = self.require_identity().await else {
                    return;
                };
                // The router answers on this connection, success or failure.
                let _ = self
                    .state
                    .router
                    .send(&sender, input, Some(&self.handle))
                    .await;
            }
            ClientEvent::MarkRead(MarkReadPayload { message_id }) => {
                let Some(user) = self.require_identity().await else {
                    return;
                };
                if let Err(e) = self.state.router.mark_read(&user, &message_id).await {
                    self.reply(ServerEvent::from(&e)).await;
                }
            }
        }
    }

    async fn identify(&mut self, payload: IdentifyPayload) {
        let Some(user_id) = payload.user_id.filter(|id| !id.trim().is_empty()) else {
            warn!("Identify without userId on {}", self.handle.id());
            self.reply(ServerEvent::error("invalid_payload", "userId is required"))
                .await;
            return;
        };

        if let Some(authenticated) = &self.authenticated {
            if authenticated != &user_id {
                warn!(
                    "Connection {} authenticated as {} tried to identify as {}",
                    self.handle.id(),
                    authenticated,
                    user_id
                );
                self.reply(ServerEvent::error(
                    "unauthorized",
                    "userId does not match the session token",
                ))
                .await;
                return;
            }
        }

        self.state.presence.register(&user_id, self.handle.clone());
        self.user_id = Some(user_id.clone());
        self.reply(ServerEvent::ConnectionConfirmed {
            user_id,
            connection_id: self.handle.id().to_string(),
        })
        .await;
    }

    async fn require_identity(&self) -> Option<String> {
        if self.user_id.is_none() {
            self.reply(ServerEvent::error(
                "not_identified",
                "send userConnected before other events",
            ))
            .await;
        }
        self.user_id.clone()
    }

    pub async fn reply(&self, event: ServerEvent) {
        self.state.router.push(&self.handle, event).await;
    }

    /// Drops this connection from presence. Returns the user that went offline.
    pub fn close(&self) -> Option<String> {
        self.state.presence.unregister(self.handle.id())
    }
}
