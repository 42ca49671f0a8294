//! Process-wide socket registry.
//!
//! One sink per `(conversation, user)`; a reader-writer lock guards the
//! map. Broadcast iterates under the read lock only — sinks that fail a
//! send are recorded and swept afterwards under the write lock, never
//! removed mid-iteration.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::chat::{ConversationId, UserId};
use crate::realtime::envelope::Envelope;

/// Per-socket queue; a dedicated writer task drains it, so writes to one
/// socket are serialized and enqueue order is preserved.
pub type SocketSink = mpsc::UnboundedSender<Envelope>;

#[derive(Default)]
pub struct SocketRegistry {
    sockets: RwLock<HashMap<(ConversationId, UserId), SocketSink>>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a sink for `(conv, user)`. An existing sink for the same
    /// key is closed first — a user has at most one live socket per
    /// conversation per process.
    pub fn register(&self, conv: ConversationId, user: UserId, sink: SocketSink) {
        let mut sockets = self.sockets.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = sockets.insert((conv, user), sink) {
            debug!("replacing live socket for user {} in {}", user, conv);
            drop(previous);
        }
    }

    /// Remove the sink for `(conv, user)`. Returns whether one existed.
    pub fn deregister(&self, conv: ConversationId, user: UserId) -> bool {
        let mut sockets = self.sockets.write().unwrap_or_else(PoisonError::into_inner);
        sockets.remove(&(conv, user)).is_some()
    }

    /// Deliver an envelope to every socket subscribed to `conv`. Failed
    /// sends are logged and the dead sinks swept after iteration; returns
    /// the number of successful deliveries.
    pub fn broadcast_to_conversation(&self, conv: ConversationId, envelope: &Envelope) -> usize {
        let mut delivered = 0;
        let mut dead: Vec<(ConversationId, UserId)> = Vec::new();
        {
            let sockets = self.sockets.read().unwrap_or_else(PoisonError::into_inner);
            for (key, sink) in sockets.iter().filter(|(key, _)| key.0 == conv) {
                if sink.send(envelope.clone()).is_ok() {
                    delivered += 1;
                } else {
                    warn!("broadcast to user {} in {} failed, scheduling removal", key.1, key.0);
                    dead.push(*key);
                }
            }
        }
        if !dead.is_empty() {
            let mut sockets = self.sockets.write().unwrap_or_else(PoisonError::into_inner);
            for key in dead {
                // Only sweep if the entry is still the closed sink; a
                // reconnect may have replaced it meanwhile.
                if sockets.get(&key).is_some_and(mpsc::UnboundedSender::is_closed) {
                    sockets.remove(&key);
                }
            }
        }
        delivered
    }

    /// Deliver to a single registered socket (heartbeat echo, error
    /// frames for senders found via the registry).
    pub fn send_to(&self, conv: ConversationId, user: UserId, envelope: Envelope) -> bool {
        let sockets = self.sockets.read().unwrap_or_else(PoisonError::into_inner);
        sockets
            .get(&(conv, user))
            .is_some_and(|sink| sink.send(envelope).is_ok())
    }

    pub fn len(&self) -> usize {
        self.sockets.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every sink. Writer tasks observe their queue closing and
    /// shut their sockets down; used on process shutdown.
    pub fn drain(&self) {
        let mut sockets = self.sockets.write().unwrap_or_else(PoisonError::into_inner);
        let count = sockets.len();
        sockets.clear();
        if count > 0 {
            debug!("drained {} registered sockets", count);
        }
    }
}
