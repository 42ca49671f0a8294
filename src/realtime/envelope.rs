use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::{ConversationId, Message, MessageId, MessageKind, UserId};

/// Realtime frame types. Unknown values fail deserialization and are
/// answered with an `error` frame by the read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Message,
    Typing,
    StopTyping,
    Heartbeat,
    UserJoined,
    UserLeft,
    Error,
}

/// Message body carried inside a `message` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub content: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// The JSON wrapper around every realtime event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<MessagePayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    pub fn message(msg: &Message) -> Self {
        Self {
            kind: EventType::Message,
            conversation_id: Some(msg.conversation),
            user_id: Some(msg.sender),
            message: Some(MessagePayload {
                id: Some(msg.id),
                content: msg.content.clone(),
                kind: msg.kind,
                parent: msg.parent,
                created_at: Some(msg.created_at),
            }),
            error: None,
        }
    }

    pub fn typing(kind: EventType, conv: ConversationId, user: UserId) -> Self {
        Self {
            kind,
            conversation_id: Some(conv),
            user_id: Some(user),
            message: None,
            error: None,
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            kind: EventType::Heartbeat,
            conversation_id: None,
            user_id: None,
            message: None,
            error: None,
        }
    }

    pub fn presence(kind: EventType, conv: ConversationId, user: UserId) -> Self {
        Self {
            kind,
            conversation_id: Some(conv),
            user_id: Some(user),
            message: None,
            error: None,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            kind: EventType::Error,
            conversation_id: None,
            user_id: None,
            message: None,
            error: Some(text.into()),
        }
    }
}
