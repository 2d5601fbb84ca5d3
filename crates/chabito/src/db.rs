//! SQLite audit log of contacts, conversations and messages.
//!
//! Rows are only ever written here; the in-memory conversation store is the
//! source of truth for what the model sees.

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use strum_macros::{Display, EnumString};
use thiserror::Error;
use uuid::Uuid;

use crate::models::message::{Message, MessageContent};
use crate::models::role::Role;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("unknown {kind} value '{value}'")]
    InvalidValue { kind: &'static str, value: String },
}

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Archived,
    Closed,
    Pending,
}

/// Value of the `type` column of `chat_message`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum MessageType {
    Human,
    Ai,
    System,
    Function,
    Tool,
}

impl From<Role> for MessageType {
    fn from(role: Role) -> Self {
        match role {
            Role::Human => MessageType::Human,
            Role::Assistant => MessageType::Ai,
            Role::System => MessageType::System,
            Role::Tool => MessageType::Tool,
        }
    }
}

/// Who is on the other side of a conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactInfo {
    pub phone_number: String,
    pub name: String,
    pub avatar_url: Option<String>,
}

impl ContactInfo {
    pub fn new<S: Into<String>, T: Into<String>>(phone_number: S, name: T) -> Self {
        Self {
            phone_number: phone_number.into(),
            name: name.into(),
            avatar_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ChatContact {
    pub id: String,
    pub phone_number: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ChatConversation {
    pub id: String,
    pub chat_contact: String,
    pub status: String,
    pub context_data: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
}

impl ChatConversation {
    pub fn status(&self) -> DbResult<ConversationStatus> {
        self.status.parse().map_err(|_| DbError::InvalidValue {
            kind: "conversation status",
            value: self.status.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ChatMessage {
    pub id: String,
    pub chat_conversation: String,
    #[sqlx(rename = "type")]
    pub message_type: String,
    pub content: String,
    pub mime_type: Option<String>,
    pub filename: Option<String>,
    pub additional_kwargs: Option<String>,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn message_type(&self) -> DbResult<MessageType> {
        self.message_type.parse().map_err(|_| DbError::InvalidValue {
            kind: "message type",
            value: self.message_type.clone(),
        })
    }
}

/// A message row before it is assigned an id and timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct NewChatMessage {
    pub message_type: MessageType,
    pub content: String,
    pub mime_type: Option<String>,
    pub filename: Option<String>,
    pub additional_kwargs: Option<String>,
    pub name: Option<String>,
}

impl From<&Message> for NewChatMessage {
    fn from(message: &Message) -> Self {
        let mut kwargs = serde_json::Map::new();

        let tool_calls: Vec<_> = message
            .tool_requests()
            .into_iter()
            .map(|request| match &request.tool_call {
                Ok(call) => json!({
                    "id": request.id,
                    "name": call.name,
                    "arguments": call.arguments,
                }),
                Err(e) => json!({ "id": request.id, "error": e.to_string() }),
            })
            .collect();
        if !tool_calls.is_empty() {
            kwargs.insert("tool_calls".to_string(), json!(tool_calls));
        }

        let mut content = message.text();
        for part in &message.content {
            if let MessageContent::ToolResponse(response) = part {
                kwargs.insert("tool_call_id".to_string(), json!(response.id));
                content = match &response.tool_result {
                    Ok(_) => part.as_tool_response_text().unwrap_or_default(),
                    Err(e) => {
                        kwargs.insert("is_error".to_string(), json!(true));
                        e.to_string()
                    }
                };
            }
        }

        let images = message.images();
        if images.len() > 1 {
            kwargs.insert("image_count".to_string(), json!(images.len()));
        }

        Self {
            message_type: message.role.into(),
            content,
            mime_type: images.first().map(|image| image.mime_type.clone()),
            filename: None,
            additional_kwargs: if kwargs.is_empty() {
                None
            } else {
                Some(serde_json::Value::Object(kwargs).to_string())
            },
            name: None,
        }
    }
}

const MESSAGE_COLUMNS: &str = "id, chat_conversation, type, content, mime_type, filename, \
                               additional_kwargs, name, created_at";

#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the database at `url`, e.g. `sqlite://chabito.db`
    /// or `sqlite::memory:`
    pub async fn connect(url: &str) -> DbResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // An in-memory database only exists for the connection that created it
        let in_memory = url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        tracing::info!(url, "connected to audit database");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> DbResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chat_contact (
                id            TEXT PRIMARY KEY,
                phone_number  TEXT NOT NULL UNIQUE,
                name          TEXT NOT NULL,
                avatar_url    TEXT,
                created_at    TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chat_conversation (
                id               TEXT PRIMARY KEY,
                chat_contact     TEXT NOT NULL REFERENCES chat_contact (id),
                status           TEXT NOT NULL DEFAULT 'active'
                                 CHECK (status IN ('active', 'archived', 'closed', 'pending')),
                context_data     TEXT,
                started_at       TEXT NOT NULL,
                last_message_at  TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chat_message (
                id                 TEXT PRIMARY KEY,
                chat_conversation  TEXT NOT NULL REFERENCES chat_conversation (id),
                type               TEXT NOT NULL
                                   CHECK (type IN ('human', 'ai', 'system', 'function', 'tool')),
                content            TEXT NOT NULL,
                mime_type          TEXT,
                filename           TEXT,
                additional_kwargs  TEXT,
                name               TEXT,
                created_at         TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS chat_message_conversation
             ON chat_message (chat_conversation, created_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert the contact, or refresh its name and avatar if the phone number is known
    pub async fn upsert_contact(&self, contact: &ContactInfo) -> DbResult<ChatContact> {
        sqlx::query(
            "INSERT INTO chat_contact (id, phone_number, name, avatar_url, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(phone_number) DO UPDATE SET
                name = excluded.name,
                avatar_url = COALESCE(excluded.avatar_url, chat_contact.avatar_url)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&contact.phone_number)
        .bind(&contact.name)
        .bind(&contact.avatar_url)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let stored = sqlx::query_as("SELECT * FROM chat_contact WHERE phone_number = ?")
            .bind(&contact.phone_number)
            .fetch_one(&self.pool)
            .await?;
        Ok(stored)
    }

    pub async fn find_contact_by_phone_number(
        &self,
        phone_number: &str,
    ) -> DbResult<Option<ChatContact>> {
        let contact = sqlx::query_as("SELECT * FROM chat_contact WHERE phone_number = ?")
            .bind(phone_number)
            .fetch_optional(&self.pool)
            .await?;
        Ok(contact)
    }

    pub async fn find_active_conversation(
        &self,
        contact_id: &str,
    ) -> DbResult<Option<ChatConversation>> {
        let conversation = sqlx::query_as(
            "SELECT * FROM chat_conversation
             WHERE chat_contact = ? AND status = 'active'
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(contact_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(conversation)
    }

    pub async fn create_conversation(&self, contact_id: &str) -> DbResult<ChatConversation> {
        let now = Utc::now();
        let conversation = ChatConversation {
            id: Uuid::new_v4().to_string(),
            chat_contact: contact_id.to_string(),
            status: ConversationStatus::Active.to_string(),
            context_data: None,
            started_at: now,
            last_message_at: now,
        };

        sqlx::query(
            "INSERT INTO chat_conversation
                (id, chat_contact, status, context_data, started_at, last_message_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&conversation.id)
        .bind(&conversation.chat_contact)
        .bind(&conversation.status)
        .bind(&conversation.context_data)
        .bind(conversation.started_at)
        .bind(conversation.last_message_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            conversation_id = %conversation.id,
            contact_id,
            "opened audit conversation"
        );
        Ok(conversation)
    }

    pub async fn set_conversation_status(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
    ) -> DbResult<()> {
        sqlx::query("UPDATE chat_conversation SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_last_message_at(&self, conversation_id: &str) -> DbResult<()> {
        sqlx::query("UPDATE chat_conversation SET last_message_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn find_conversations_by_status(
        &self,
        status: ConversationStatus,
    ) -> DbResult<Vec<ChatConversation>> {
        let conversations = sqlx::query_as(
            "SELECT * FROM chat_conversation WHERE status = ? ORDER BY started_at",
        )
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(conversations)
    }

    pub async fn insert_message(
        &self,
        conversation_id: &str,
        message: &NewChatMessage,
    ) -> DbResult<ChatMessage> {
        let row = ChatMessage {
            id: Uuid::new_v4().to_string(),
            chat_conversation: conversation_id.to_string(),
            message_type: message.message_type.to_string(),
            content: message.content.clone(),
            mime_type: message.mime_type.clone(),
            filename: message.filename.clone(),
            additional_kwargs: message.additional_kwargs.clone(),
            name: message.name.clone(),
            created_at: Utc::now(),
        };

        sqlx::query(&format!(
            "INSERT INTO chat_message ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            MESSAGE_COLUMNS
        ))
        .bind(&row.id)
        .bind(&row.chat_conversation)
        .bind(&row.message_type)
        .bind(&row.content)
        .bind(&row.mime_type)
        .bind(&row.filename)
        .bind(&row.additional_kwargs)
        .bind(&row.name)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(row)
    }

    /// All messages of a conversation, oldest first
    pub async fn find_messages_by_conversation(
        &self,
        conversation_id: &str,
    ) -> DbResult<Vec<ChatMessage>> {
        let messages = sqlx::query_as(&format!(
            "SELECT {} FROM chat_message WHERE chat_conversation = ?
             ORDER BY created_at, rowid",
            MESSAGE_COLUMNS
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    pub async fn find_messages_by_type(
        &self,
        conversation_id: &str,
        message_type: MessageType,
    ) -> DbResult<Vec<ChatMessage>> {
        let messages = sqlx::query_as(&format!(
            "SELECT {} FROM chat_message WHERE chat_conversation = ? AND type = ?
             ORDER BY created_at, rowid",
            MESSAGE_COLUMNS
        ))
        .bind(conversation_id)
        .bind(message_type.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    /// The `limit` most recent messages, newest first
    pub async fn find_last_messages(
        &self,
        conversation_id: &str,
        limit: u32,
    ) -> DbResult<Vec<ChatMessage>> {
        let messages = sqlx::query_as(&format!(
            "SELECT {} FROM chat_message WHERE chat_conversation = ?
             ORDER BY created_at DESC, rowid DESC LIMIT ?",
            MESSAGE_COLUMNS
        ))
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    /// Messages that carried an attachment
    pub async fn find_multimedia_messages(
        &self,
        conversation_id: &str,
    ) -> DbResult<Vec<ChatMessage>> {
        let messages = sqlx::query_as(&format!(
            "SELECT {} FROM chat_message
             WHERE chat_conversation = ? AND mime_type IS NOT NULL
             ORDER BY created_at, rowid",
            MESSAGE_COLUMNS
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    /// Append `messages` to the contact's active conversation, opening one if needed.
    /// Returns the conversation id.
    pub async fn record_turn(
        &self,
        contact: &ContactInfo,
        messages: &[Message],
    ) -> DbResult<String> {
        let stored_contact = self.upsert_contact(contact).await?;
        let conversation = match self.find_active_conversation(&stored_contact.id).await? {
            Some(conversation) => conversation,
            None => self.create_conversation(&stored_contact.id).await?,
        };

        for message in messages {
            self.insert_message(&conversation.id, &NewChatMessage::from(message))
                .await?;
        }
        self.update_last_message_at(&conversation.id).await?;

        tracing::debug!(
            conversation_id = %conversation.id,
            recorded = messages.len(),
            "recorded turn"
        );
        Ok(conversation.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AgentError;
    use crate::models::content::Content;
    use crate::models::tool::ToolCall;

    async fn database() -> Database {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let db = database().await;
        db.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn test_upsert_contact_keeps_identity() {
        let db = database().await;
        let first = db
            .upsert_contact(&ContactInfo::new("5215512345678", "Ana"))
            .await
            .unwrap();
        let second = db
            .upsert_contact(&ContactInfo::new("5215512345678", "Ana María"))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "Ana María");
        assert!(db
            .find_contact_by_phone_number("000")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_record_turn_reuses_active_conversation() {
        let db = database().await;
        let contact = ContactInfo::new("5215512345678", "Ana");

        let first = db
            .record_turn(
                &contact,
                &[
                    Message::system().with_text("Eres chabito"),
                    Message::human().with_text("Hola"),
                    Message::assistant().with_text("Hola Ana"),
                ],
            )
            .await
            .unwrap();
        let second = db
            .record_turn(
                &contact,
                &[
                    Message::human().with_text("Adiós"),
                    Message::assistant().with_text("Hasta luego"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(first, second);

        let messages = db.find_messages_by_conversation(&first).await.unwrap();
        let types: Vec<MessageType> = messages
            .iter()
            .map(|m| m.message_type().unwrap())
            .collect();
        assert_eq!(
            types,
            vec![
                MessageType::System,
                MessageType::Human,
                MessageType::Ai,
                MessageType::Human,
                MessageType::Ai
            ]
        );
        assert_eq!(messages[4].content, "Hasta luego");

        let last = db.find_last_messages(&first, 2).await.unwrap();
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].content, "Hasta luego");
        assert_eq!(last[1].content, "Adiós");

        let humans = db
            .find_messages_by_type(&first, MessageType::Human)
            .await
            .unwrap();
        assert_eq!(humans.len(), 2);
    }

    #[tokio::test]
    async fn test_closed_conversation_starts_a_new_one() {
        let db = database().await;
        let contact = ContactInfo::new("5215512345678", "Ana");
        let first = db
            .record_turn(&contact, &[Message::human().with_text("Hola")])
            .await
            .unwrap();
        db.set_conversation_status(&first, ConversationStatus::Closed)
            .await
            .unwrap();

        let second = db
            .record_turn(&contact, &[Message::human().with_text("Otra vez")])
            .await
            .unwrap();
        assert_ne!(first, second);

        let closed = db
            .find_conversations_by_status(ConversationStatus::Closed)
            .await
            .unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].status().unwrap(), ConversationStatus::Closed);
    }

    #[tokio::test]
    async fn test_status_check_constraint() {
        let db = database().await;
        let contact = db
            .upsert_contact(&ContactInfo::new("1", "Ana"))
            .await
            .unwrap();
        let conversation = db.create_conversation(&contact.id).await.unwrap();

        let result = sqlx::query("UPDATE chat_conversation SET status = 'deleted' WHERE id = ?")
            .bind(&conversation.id)
            .execute(db.pool())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_multimedia_and_tool_messages() {
        let db = database().await;
        let contact = ContactInfo::new("5215512345678", "Ana");
        let conversation = db
            .record_turn(
                &contact,
                &[
                    Message::human()
                        .with_text("¿Qué hay aquí?")
                        .with_image("aGVsbG8=", "image/png"),
                    Message::assistant().with_tool_request(
                        "call_1",
                        Ok(ToolCall::new("current_datetime", serde_json::json!({}))),
                    ),
                    Message::tool().with_tool_response(
                        "call_1",
                        Ok(vec![Content::text("2024-01-01T00:00:00Z")]),
                    ),
                    Message::assistant().with_tool_request(
                        "call_2",
                        Err(AgentError::InvalidParameters("bad".into())),
                    ),
                    Message::tool().with_tool_response(
                        "call_2",
                        Err(AgentError::InvalidParameters("bad".into())),
                    ),
                    Message::assistant().with_text("Una imagen"),
                ],
            )
            .await
            .unwrap();

        let multimedia = db.find_multimedia_messages(&conversation).await.unwrap();
        assert_eq!(multimedia.len(), 1);
        assert_eq!(multimedia[0].mime_type.as_deref(), Some("image/png"));
        assert_eq!(multimedia[0].content, "¿Qué hay aquí?");

        let tools = db
            .find_messages_by_type(&conversation, MessageType::Tool)
            .await
            .unwrap();
        assert_eq!(tools[0].content, "2024-01-01T00:00:00Z");
        let kwargs: serde_json::Value =
            serde_json::from_str(tools[0].additional_kwargs.as_deref().unwrap()).unwrap();
        assert_eq!(kwargs["tool_call_id"], "call_1");
        let kwargs: serde_json::Value =
            serde_json::from_str(tools[1].additional_kwargs.as_deref().unwrap()).unwrap();
        assert_eq!(kwargs["is_error"], true);

        let ai = db
            .find_messages_by_type(&conversation, MessageType::Ai)
            .await
            .unwrap();
        let kwargs: serde_json::Value =
            serde_json::from_str(ai[0].additional_kwargs.as_deref().unwrap()).unwrap();
        assert_eq!(kwargs["tool_calls"][0]["name"], "current_datetime");
    }

    #[test]
    fn test_parse_values() {
        assert_eq!(
            "pending".parse::<ConversationStatus>().unwrap(),
            ConversationStatus::Pending
        );
        assert!("deleted".parse::<ConversationStatus>().is_err());
        assert_eq!(MessageType::from(Role::Assistant), MessageType::Ai);
        assert!("assistant".parse::<MessageType>().is_err());
        assert_eq!(MessageType::Ai.to_string(), "ai");
        assert_eq!(ConversationStatus::Archived.to_string(), "archived");
    }

    #[test]
    fn test_unknown_stored_status() {
        let now = Utc::now();
        let conversation = ChatConversation {
            id: "c1".to_string(),
            chat_contact: "k1".to_string(),
            status: "deleted".to_string(),
            context_data: None,
            started_at: now,
            last_message_at: now,
        };
        match conversation.status() {
            Err(DbError::InvalidValue { kind, value }) => {
                assert_eq!(kind, "conversation status");
                assert_eq!(value, "deleted");
            }
            other => panic!("expected invalid value, got {:?}", other),
        }
    }
}
