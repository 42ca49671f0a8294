//! Conversation operations with membership enforcement.
//!
//! All message content is a sensitive field: it passes through the
//! versioned encryptor on write and on read, so the store only ever sees
//! ciphertext.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::chat::model::{
    Conversation, ConversationId, ConversationSummary, Message, MessageId, NewMessage, UserId,
};
use crate::chat::store::ChatStore;
use crate::crypto::{FieldCipher, is_encrypted};
use crate::errors::{Result, TetherError};

const LIST_LIMIT_DEFAULT: u32 = 20;
const MESSAGES_LIMIT_DEFAULT: u32 = 50;
const LIMIT_MAX: u32 = 100;

pub struct ChatService {
    store: Arc<dyn ChatStore>,
    cipher: Arc<FieldCipher>,
    max_message_len: usize,
}

impl ChatService {
    pub fn new(store: Arc<dyn ChatStore>, cipher: Arc<FieldCipher>, max_message_len: usize) -> Self {
        Self {
            store,
            cipher,
            max_message_len,
        }
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    /// Create (or return the existing) direct conversation between two
    /// distinct users.
    pub async fn create_direct_conversation(
        &self,
        creator: UserId,
        other: UserId,
    ) -> Result<Conversation> {
        if creator == other {
            return Err(TetherError::validation(
                "participants",
                "a direct conversation needs two distinct users",
            ));
        }
        self.store.create_direct(creator, other).await
    }

    /// Create a group conversation. The creator is always a participant.
    pub async fn create_group_conversation(
        &self,
        creator: UserId,
        name: Option<String>,
        mut participants: Vec<UserId>,
    ) -> Result<Conversation> {
        if !participants.contains(&creator) {
            participants.push(creator);
        }
        self.store.create_group(creator, name, &participants).await
    }

    pub async fn list_conversations(
        &self,
        user: UserId,
        limit: Option<u32>,
        offset: u32,
    ) -> Result<Vec<ConversationSummary>> {
        let limit = resolve_limit(limit, LIST_LIMIT_DEFAULT)?;
        let mut summaries = self.store.list_for_user(user, limit, offset).await?;
        for summary in &mut summaries {
            if let Some(message) = &mut summary.last_message {
                message.content = self.reveal(&message.content)?;
            }
        }
        Ok(summaries)
    }

    /// Messages in a conversation, newest first. Requires membership.
    pub async fn get_messages(
        &self,
        conv: ConversationId,
        user: UserId,
        limit: Option<u32>,
        offset: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let limit = resolve_limit(limit, MESSAGES_LIMIT_DEFAULT)?;
        self.require_member(conv, user).await?;
        let mut messages = self.store.messages(conv, limit, offset, before).await?;
        for message in &mut messages {
            message.content = self.reveal(&message.content)?;
        }
        Ok(messages)
    }

    /// Persist a message. Returns it with plaintext content so callers
    /// can broadcast without a second decrypt.
    pub async fn send_message(
        &self,
        conv: ConversationId,
        sender: UserId,
        new: NewMessage,
    ) -> Result<Message> {
        self.require_member(conv, sender).await?;

        let content = new.content;
        if content.trim().is_empty() {
            return Err(TetherError::validation("content", "must not be empty"));
        }
        if content.len() > self.max_message_len {
            return Err(TetherError::validation(
                "content",
                format!("exceeds maximum length of {} bytes", self.max_message_len),
            ));
        }
        if let Some(parent) = new.parent {
            let parent_msg = self
                .store
                .message(parent)
                .await?
                .ok_or_else(|| TetherError::validation("parent", "parent message does not exist"))?;
            if parent_msg.conversation != conv {
                return Err(TetherError::validation(
                    "parent",
                    "parent message belongs to a different conversation",
                ));
            }
        }

        let message = Message {
            id: Uuid::new_v4(),
            conversation: conv,
            sender,
            content,
            kind: new.kind,
            created_at: Utc::now(),
            edited_at: None,
            parent: new.parent,
        };

        let mut stored = message.clone();
        stored.content = self.cipher.encrypt(&message.content)?;
        self.store.insert_message(&stored).await?;
        debug!(
            "message {} persisted in conversation {}",
            message.id, message.conversation
        );
        Ok(message)
    }

    /// Upsert a read receipt. The reader must be a member of the
    /// message's conversation.
    pub async fn mark_read(&self, message: MessageId, user: UserId) -> Result<()> {
        let msg = self
            .store
            .message(message)
            .await?
            .ok_or_else(|| TetherError::not_found("message"))?;
        if !self.store.is_member(msg.conversation, user).await? {
            return Err(TetherError::Authorization(
                "not a member of this conversation".into(),
            ));
        }
        self.store.mark_read(message, user, Utc::now()).await
    }

    pub async fn is_member(&self, conv: ConversationId, user: UserId) -> Result<bool> {
        self.store.is_member(conv, user).await
    }

    /// The most recent `n` messages, oldest first — input for the
    /// conversation summarizer.
    pub async fn recent_messages(
        &self,
        conv: ConversationId,
        user: UserId,
        n: u32,
    ) -> Result<Vec<Message>> {
        let mut messages = self
            .get_messages(conv, user, Some(n.clamp(1, LIMIT_MAX)), 0, None)
            .await?;
        messages.reverse();
        Ok(messages)
    }

    async fn require_member(&self, conv: ConversationId, user: UserId) -> Result<()> {
        if self.store.conversation(conv).await?.is_none() {
            return Err(TetherError::not_found("conversation"));
        }
        if !self.store.is_member(conv, user).await? {
            return Err(TetherError::Authorization(
                "not a member of this conversation".into(),
            ));
        }
        Ok(())
    }

    fn reveal(&self, content: &str) -> Result<String> {
        if is_encrypted(content) {
            self.cipher.decrypt(content)
        } else {
            // Rows written before encryption was enabled stay readable.
            Ok(content.to_string())
        }
    }
}

fn resolve_limit(requested: Option<u32>, default: u32) -> Result<u32> {
    match requested {
        None => Ok(default),
        Some(limit) if (1..=LIMIT_MAX).contains(&limit) => Ok(limit),
        Some(limit) => Err(TetherError::validation(
            "limit",
            format!("must be within [1, {}], got {}", LIMIT_MAX, limit),
        )),
    }
}
