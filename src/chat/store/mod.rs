//! Conversation persistence.
//!
//! [`ChatStore`] is the storage seam; [`SqliteChatStore`] is the bundled
//! implementation. Message timestamps are stored as microseconds since
//! the epoch so `ORDER BY` needs no parsing; the autoincrement `seq`
//! column is the server-generated tiebreaker for equal timestamps.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use crate::chat::model::{
    Conversation, ConversationId, ConversationKind, ConversationSummary, Message, MessageId,
    MessageKind, Participant, UserId,
};
use crate::errors::{Result, TetherError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    creator TEXT NOT NULL,
    name TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS participants (
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    user_id TEXT NOT NULL,
    joined_at INTEGER NOT NULL,
    PRIMARY KEY (conversation_id, user_id)
);

CREATE TABLE IF NOT EXISTS direct_pairs (
    user_lo TEXT NOT NULL,
    user_hi TEXT NOT NULL,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    PRIMARY KEY (user_lo, user_hi)
);

CREATE TABLE IF NOT EXISTS messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    sender_id TEXT NOT NULL,
    content TEXT NOT NULL,
    kind TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    edited_at INTEGER,
    parent_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_messages_conv_time
    ON messages(conversation_id, created_at DESC, seq DESC);

CREATE TABLE IF NOT EXISTS read_receipts (
    message_id TEXT NOT NULL REFERENCES messages(id),
    user_id TEXT NOT NULL,
    read_at INTEGER NOT NULL,
    PRIMARY KEY (message_id, user_id)
);
";

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Liveness probe: a trivial query must return its expected constant.
    async fn ping(&self) -> Result<()>;

    /// Create (or return the existing) direct conversation between two
    /// users. Direct conversations are deduplicated by unordered pair.
    async fn create_direct(&self, creator: UserId, other: UserId) -> Result<Conversation>;

    /// Create a group conversation with an initial participant set.
    async fn create_group(
        &self,
        creator: UserId,
        name: Option<String>,
        participants: &[UserId],
    ) -> Result<Conversation>;

    async fn conversation(&self, id: ConversationId) -> Result<Option<Conversation>>;

    async fn is_member(&self, conv: ConversationId, user: UserId) -> Result<bool>;

    async fn participants(&self, conv: ConversationId) -> Result<Vec<Participant>>;

    /// Conversations the user participates in, newest activity first,
    /// with unread count and last message hydrated in one query.
    async fn list_for_user(
        &self,
        user: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConversationSummary>>;

    async fn insert_message(&self, message: &Message) -> Result<()>;

    async fn message(&self, id: MessageId) -> Result<Option<Message>>;

    /// Messages in a conversation, `created_at DESC` with the insertion
    /// sequence as tiebreaker, optionally only those before an instant.
    async fn messages(
        &self,
        conv: ConversationId,
        limit: u32,
        offset: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>>;

    async fn mark_read(&self, message: MessageId, user: UserId, at: DateTime<Utc>) -> Result<()>;

    /// All stored message payloads, for bulk re-encryption.
    async fn message_contents(&self) -> Result<Vec<(MessageId, String)>>;

    async fn update_message_content(&self, id: MessageId, content: &str) -> Result<()>;
}

pub struct SqliteChatStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> TetherError {
    TetherError::Internal(anyhow::anyhow!("chat store: {}", e))
}

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_micros()
}

fn from_ts(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

fn parse_uuid(text: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

impl SqliteChatStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| TetherError::Internal(anyhow::anyhow!("open chat store: {}", e)))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| TetherError::Internal(anyhow::anyhow!("open chat store: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        // Other stores open their own connections to the same file.
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err)?;
        let _: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(db_err)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        kind: row
            .get::<_, String>(1)?
            .parse()
            .unwrap_or(ConversationKind::Group),
        creator: parse_uuid(&row.get::<_, String>(2)?)?,
        name: row.get(3)?,
        created_at: from_ts(row.get(4)?),
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        conversation: parse_uuid(&row.get::<_, String>(1)?)?,
        sender: parse_uuid(&row.get::<_, String>(2)?)?,
        content: row.get(3)?,
        kind: row.get::<_, String>(4)?.parse().unwrap_or_default(),
        created_at: from_ts(row.get(5)?),
        edited_at: row.get::<_, Option<i64>>(6)?.map(from_ts),
        parent: row
            .get::<_, Option<String>>(7)?
            .as_deref()
            .map(parse_uuid)
            .transpose()?,
    })
}

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, content, kind, created_at, edited_at, parent_id";

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn ping(&self) -> Result<()> {
        let conn = self.lock();
        let probe: i64 = conn
            .query_row("SELECT 1", [], |row| row.get(0))
            .map_err(db_err)?;
        if probe != 1 {
            return Err(TetherError::Fatal("probe query returned the wrong constant".into()));
        }
        Ok(())
    }

    async fn create_direct(&self, creator: UserId, other: UserId) -> Result<Conversation> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(db_err)?;

        // Unordered-pair key: lexicographically smaller id first.
        let (lo, hi) = if creator.to_string() <= other.to_string() {
            (creator, other)
        } else {
            (other, creator)
        };

        let existing: Option<String> = tx
            .query_row(
                "SELECT conversation_id FROM direct_pairs WHERE user_lo = ?1 AND user_hi = ?2",
                params![lo.to_string(), hi.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        if let Some(id) = existing {
            let conversation = tx
                .query_row(
                    "SELECT id, kind, creator, name, created_at FROM conversations WHERE id = ?1",
                    params![id],
                    row_to_conversation,
                )
                .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            return Ok(conversation);
        }

        let conversation = Conversation {
            id: Uuid::new_v4(),
            kind: ConversationKind::Direct,
            creator,
            name: None,
            created_at: Utc::now(),
        };
        tx.execute(
            "INSERT INTO conversations (id, kind, creator, name, created_at)
             VALUES (?1, ?2, ?3, NULL, ?4)",
            params![
                conversation.id.to_string(),
                conversation.kind.as_str(),
                creator.to_string(),
                ts(conversation.created_at),
            ],
        )
        .map_err(db_err)?;
        for user in [creator, other] {
            tx.execute(
                "INSERT INTO participants (conversation_id, user_id, joined_at)
                 VALUES (?1, ?2, ?3)",
                params![
                    conversation.id.to_string(),
                    user.to_string(),
                    ts(conversation.created_at),
                ],
            )
            .map_err(db_err)?;
        }
        tx.execute(
            "INSERT INTO direct_pairs (user_lo, user_hi, conversation_id)
             VALUES (?1, ?2, ?3)",
            params![lo.to_string(), hi.to_string(), conversation.id.to_string()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(conversation)
    }

    async fn create_group(
        &self,
        creator: UserId,
        name: Option<String>,
        participants: &[UserId],
    ) -> Result<Conversation> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(db_err)?;

        let conversation = Conversation {
            id: Uuid::new_v4(),
            kind: ConversationKind::Group,
            creator,
            name,
            created_at: Utc::now(),
        };
        tx.execute(
            "INSERT INTO conversations (id, kind, creator, name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                conversation.id.to_string(),
                conversation.kind.as_str(),
                creator.to_string(),
                conversation.name,
                ts(conversation.created_at),
            ],
        )
        .map_err(db_err)?;
        for user in participants {
            tx.execute(
                "INSERT OR IGNORE INTO participants (conversation_id, user_id, joined_at)
                 VALUES (?1, ?2, ?3)",
                params![
                    conversation.id.to_string(),
                    user.to_string(),
                    ts(conversation.created_at),
                ],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(conversation)
    }

    async fn conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, kind, creator, name, created_at FROM conversations WHERE id = ?1",
            params![id.to_string()],
            row_to_conversation,
        )
        .optional()
        .map_err(db_err)
    }

    async fn is_member(&self, conv: ConversationId, user: UserId) -> Result<bool> {
        let conn = self.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM participants WHERE conversation_id = ?1 AND user_id = ?2",
                params![conv.to_string(), user.to_string()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count > 0)
    }

    async fn participants(&self, conv: ConversationId) -> Result<Vec<Participant>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT conversation_id, user_id, joined_at FROM participants
                 WHERE conversation_id = ?1 ORDER BY joined_at",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![conv.to_string()], |row| {
                Ok(Participant {
                    conversation: parse_uuid(&row.get::<_, String>(0)?)?,
                    user: parse_uuid(&row.get::<_, String>(1)?)?,
                    joined_at: from_ts(row.get(2)?),
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn list_for_user(
        &self,
        user: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConversationSummary>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT c.id, c.kind, c.creator, c.name, c.created_at,
                        (SELECT COUNT(*) FROM messages m
                          WHERE m.conversation_id = c.id
                            AND m.sender_id != ?1
                            AND NOT EXISTS (SELECT 1 FROM read_receipts r
                                             WHERE r.message_id = m.id AND r.user_id = ?1)),
                        lm.id, lm.conversation_id, lm.sender_id, lm.content, lm.kind,
                        lm.created_at, lm.edited_at, lm.parent_id
                 FROM conversations c
                 JOIN participants p ON p.conversation_id = c.id AND p.user_id = ?1
                 LEFT JOIN messages lm ON lm.seq = (
                     SELECT seq FROM messages
                      WHERE conversation_id = c.id
                      ORDER BY created_at DESC, seq DESC LIMIT 1)
                 ORDER BY COALESCE(lm.created_at, c.created_at) DESC
                 LIMIT ?2 OFFSET ?3",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![user.to_string(), limit, offset], |row| {
                let conversation = row_to_conversation(row)?;
                let unread_count: i64 = row.get(5)?;
                let last_message = match row.get::<_, Option<String>>(6)? {
                    Some(id) => Some(Message {
                        id: parse_uuid(&id)?,
                        conversation: parse_uuid(&row.get::<_, String>(7)?)?,
                        sender: parse_uuid(&row.get::<_, String>(8)?)?,
                        content: row.get(9)?,
                        kind: row.get::<_, String>(10)?.parse().unwrap_or_default(),
                        created_at: from_ts(row.get(11)?),
                        edited_at: row.get::<_, Option<i64>>(12)?.map(from_ts),
                        parent: row
                            .get::<_, Option<String>>(13)?
                            .as_deref()
                            .map(parse_uuid)
                            .transpose()?,
                    }),
                    None => None,
                };
                Ok(ConversationSummary {
                    conversation,
                    unread_count: unread_count.max(0) as u64,
                    last_message,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn insert_message(&self, message: &Message) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO messages (id, conversation_id, sender_id, content, kind,
                                   created_at, edited_at, parent_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.id.to_string(),
                message.conversation.to_string(),
                message.sender.to_string(),
                message.content,
                message.kind.as_str(),
                ts(message.created_at),
                message.edited_at.map(ts),
                message.parent.map(|p| p.to_string()),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn message(&self, id: MessageId) -> Result<Option<Message>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
            params![id.to_string()],
            row_to_message,
        )
        .optional()
        .map_err(db_err)
    }

    async fn messages(
        &self,
        conv: ConversationId,
        limit: u32,
        offset: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let conn = self.lock();
        let cutoff = before.map(ts).unwrap_or(i64::MAX);
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM messages
                 WHERE conversation_id = ?1 AND created_at < ?2
                 ORDER BY created_at DESC, seq DESC
                 LIMIT ?3 OFFSET ?4",
                MESSAGE_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![conv.to_string(), cutoff, limit, offset], row_to_message)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn mark_read(&self, message: MessageId, user: UserId, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO read_receipts (message_id, user_id, read_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(message_id, user_id) DO UPDATE SET read_at = excluded.read_at",
            params![message.to_string(), user.to_string(), ts(at)],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn message_contents(&self) -> Result<Vec<(MessageId, String)>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT id, content FROM messages ORDER BY seq")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((parse_uuid(&row.get::<_, String>(0)?)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn update_message_content(&self, id: MessageId, content: &str) -> Result<()> {
        let conn = self.lock();
        let changed = conn
            .execute(
                "UPDATE messages SET content = ?2 WHERE id = ?1",
                params![id.to_string(), content],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(TetherError::not_found("message"));
        }
        Ok(())
    }
}
