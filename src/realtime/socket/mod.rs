//! Authenticated WebSocket upgrade and the per-connection loop.
//!
//! One read task per socket; writes go through a per-socket queue
//! drained by a dedicated writer task, so frames to one socket are
//! serialized. Loop exit for any reason deregisters the socket and
//! announces `user_left`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::http::HeaderMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::TokenValidator;
use crate::chat::{ChatService, ConversationId, NewMessage, UserId};
use crate::errors::{Result, TetherError};
use crate::realtime::envelope::{Envelope, EventType};
use crate::realtime::registry::{SocketRegistry, SocketSink};

/// Sub-protocol the client must offer on upgrade.
pub const REQUIRED_SUBPROTOCOL: &str = "jwt";

/// Repeated `typing` frames inside this window are dropped.
const TYPING_COALESCE_WINDOW: Duration = Duration::from_secs(2);

pub struct RealtimeServer {
    chat: Arc<ChatService>,
    registry: Arc<SocketRegistry>,
    tokens: Arc<dyn TokenValidator>,
    shutdown: CancellationToken,
}

impl RealtimeServer {
    pub fn new(
        chat: Arc<ChatService>,
        registry: Arc<SocketRegistry>,
        tokens: Arc<dyn TokenValidator>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            chat,
            registry,
            tokens,
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<SocketRegistry> {
        &self.registry
    }

    /// Everything that must pass before the connection is upgraded:
    /// sub-protocol, token, conversation id format, membership.
    pub async fn authorize(
        &self,
        headers: &HeaderMap,
        conv_path: &str,
        token_query: Option<&str>,
    ) -> Result<(ConversationId, UserId)> {
        if self.shutdown.is_cancelled() {
            return Err(TetherError::transient("shutting down", None));
        }

        let offered = headers
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let mut protocols = offered.split(',').map(str::trim).filter(|p| !p.is_empty());
        if !protocols.clone().any(|p| p == REQUIRED_SUBPROTOCOL) {
            return Err(TetherError::validation(
                "subprotocol",
                format!("client must offer the {:?} sub-protocol", REQUIRED_SUBPROTOCOL),
            ));
        }

        // Token from the query string, or smuggled as an extra
        // sub-protocol entry for clients that cannot set query params.
        let token = match token_query {
            Some(token) if !token.is_empty() => token.to_string(),
            _ => protocols
                .find(|p| *p != REQUIRED_SUBPROTOCOL)
                .map(str::to_string)
                .ok_or_else(|| TetherError::Authentication("no token presented".into()))?,
        };
        let claims = self.tokens.validate(&token).await?;

        let conv = Uuid::parse_str(conv_path).map_err(|_| {
            TetherError::validation("conversation_id", "not a valid conversation identifier")
        })?;

        if !self.chat.is_member(conv, claims.user_id).await? {
            return Err(TetherError::Authorization(
                "not a member of this conversation".into(),
            ));
        }
        Ok((conv, claims.user_id))
    }

    /// Drive one upgraded socket until it closes, errors, or the process
    /// shuts down.
    pub async fn serve_connection(self: Arc<Self>, socket: WebSocket, conv: ConversationId, user: UserId) {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

        let writer = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let Ok(text) = serde_json::to_string(&envelope) else {
                    continue;
                };
                if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        self.registry.register(conv, user, tx.clone());
        self.registry
            .broadcast_to_conversation(conv, &Envelope::presence(EventType::UserJoined, conv, user));
        info!("socket open: user {} in conversation {}", user, conv);

        let mut last_typing: Option<Instant> = None;
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    debug!("socket for user {} closing on shutdown", user);
                    break;
                }
                incoming = ws_rx.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        self.handle_frame(conv, user, text.as_str(), &tx, &mut last_typing)
                            .await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong/binary — nothing to do
                    Some(Err(e)) => {
                        debug!("socket read error for user {}: {}", user, e);
                        break;
                    }
                },
            }
        }

        self.registry.deregister(conv, user);
        drop(tx);
        self.registry
            .broadcast_to_conversation(conv, &Envelope::presence(EventType::UserLeft, conv, user));
        let _ = writer.await;
        info!("socket closed: user {} in conversation {}", user, conv);
    }

    /// Handle one inbound frame. Errors go back on the originating sink
    /// only; the loop keeps running.
    pub async fn handle_frame(
        &self,
        conv: ConversationId,
        user: UserId,
        text: &str,
        sink: &SocketSink,
        last_typing: &mut Option<Instant>,
    ) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                let _ = sink.send(Envelope::error(format!("unrecognized frame: {}", e)));
                return;
            }
        };

        if envelope.conversation_id.is_some_and(|c| c != conv) {
            let _ = sink.send(Envelope::error(
                "frame addressed to a different conversation",
            ));
            return;
        }

        match envelope.kind {
            EventType::Message => {
                let Some(payload) = envelope.message else {
                    let _ = sink.send(Envelope::error("message frame requires a message body"));
                    return;
                };
                let new = NewMessage {
                    content: payload.content,
                    kind: payload.kind,
                    parent: payload.parent,
                };
                match self.chat.send_message(conv, user, new).await {
                    Ok(message) => {
                        self.registry
                            .broadcast_to_conversation(conv, &Envelope::message(&message));
                    }
                    Err(e) => {
                        warn!("send from user {} rejected: {}", user, e);
                        let _ = sink.send(Envelope::error(e.to_string()));
                    }
                }
            }
            EventType::Typing => {
                let now = Instant::now();
                if last_typing.is_some_and(|t| now.duration_since(t) < TYPING_COALESCE_WINDOW) {
                    return;
                }
                *last_typing = Some(now);
                self.registry
                    .broadcast_to_conversation(conv, &Envelope::typing(EventType::Typing, conv, user));
            }
            EventType::StopTyping => {
                *last_typing = None;
                self.registry.broadcast_to_conversation(
                    conv,
                    &Envelope::typing(EventType::StopTyping, conv, user),
                );
            }
            EventType::Heartbeat => {
                let _ = sink.send(Envelope::heartbeat());
            }
            EventType::UserJoined | EventType::UserLeft | EventType::Error => {
                let _ = sink.send(Envelope::error("frame type is server-generated"));
            }
        }
    }
}

#[cfg(test)]
mod tests;
