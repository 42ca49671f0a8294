//! Cross-instance realtime event bus seam.
//!
//! Instances publish [`RealtimeEvent`]s; subscribers on other instances
//! re-broadcast them into their local socket registry. The wire
//! transport is a deployment concern — in a single-process deployment
//! the loopback bus short-circuits publish to the local subscribers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::chat::{ConversationId, UserId};
use crate::errors::Result;
use crate::realtime::EventType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub event: EventType,
    pub conversation: ConversationId,
    pub user: Option<UserId>,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait PubSubBus: Send + Sync {
    async fn publish(&self, event: RealtimeEvent) -> Result<()>;
}

/// In-process bus: publish fans out to local subscribers only.
pub struct LoopbackBus {
    tx: broadcast::Sender<RealtimeEvent>,
}

impl LoopbackBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.tx.subscribe()
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl PubSubBus for LoopbackBus {
    async fn publish(&self, event: RealtimeEvent) -> Result<()> {
        // No subscribers is fine; events are fire-and-forget.
        let _ = self.tx.send(event);
        Ok(())
    }
}
