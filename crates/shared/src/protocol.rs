use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{FileId, MessageId, RoomId, TaskId, UserId};

/// Event kind tag carried by every chat broadcast frame.
pub const CHAT_MESSAGE_KIND: &str = "chat_message";

/// Display projection of a message author.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorProjection {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub email: String,
}

impl AuthorProjection {
    pub fn placeholder(user_id: UserId) -> Self {
        Self {
            id: user_id.0,
            username: format!("User {}", user_id.0),
            name: format!("User {}", user_id.0),
            ..Self::default()
        }
    }

    pub fn display_name(&self) -> &str {
        if !self.name.is_empty() {
            &self.name
        } else if !self.username.is_empty() {
            &self.username
        } else {
            &self.email
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub content: String,
    #[serde(rename = "user_id")]
    pub author_id: UserId,
    #[serde(rename = "user", default)]
    pub author: AuthorProjection,
    #[serde(rename = "project_id")]
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<FileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn trimmed_content(&self) -> &str {
        self.content.trim()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMessageRequest {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<FileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

/// Body of a message listing; the API returns either a bare array or an
/// object wrapping it.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageList {
    Bare(Vec<ChatMessage>),
    Wrapped {
        #[serde(default)]
        messages: Vec<ChatMessage>,
    },
}

impl MessageList {
    pub fn into_messages(self) -> Vec<ChatMessage> {
        match self {
            Self::Bare(messages) | Self::Wrapped { messages } => messages,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ChatMessage,
}

/// Real-time broadcast frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEnvelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(rename = "project_id")]
    pub room_id: RoomId,
    #[serde(rename = "data")]
    pub payload: ChatMessage,
}

/// Frames the client writes on the real-time channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping,
}
