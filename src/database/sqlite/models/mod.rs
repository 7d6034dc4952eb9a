
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};

use crate::model::ChatMessage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub session_id: String,
    pub agent_id: String,
    pub session_name: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct SessionTurn {
    pub id: i64,
    pub session_id: String,
    pub position: i64,
    pub role: TurnRole,
    pub content: String,
    pub status: TurnStatus,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl SessionTurn {
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.status == TurnStatus::Complete
    }

    #[inline]
    pub fn to_message(&self) -> ChatMessage {
        match self.role {
            TurnRole::User => ChatMessage::user(&self.content),
            TurnRole::Assistant => ChatMessage::assistant(&self.content),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl std::fmt::Display for TurnRole {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            TurnRole::User => write!(f, "user"),
            TurnRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// Lifecycle of a turn. Assistant turns start as `Streaming` and end in one
/// of the other states; user turns are always `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum TurnStatus {
    Streaming,
    Complete,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TurnStatus {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            TurnStatus::Streaming => write!(f, "streaming"),
            TurnStatus::Complete => write!(f, "complete"),
            TurnStatus::Failed => write!(f, "failed"),
            TurnStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTurn {
    pub session_id: String,
    pub role: TurnRole,
    pub content: String,
    pub status: TurnStatus,
}

impl NewTurn {
    #[inline]
    pub fn user(session_id: &str, content: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            role: TurnRole::User,
            content: content.to_string(),
            status: TurnStatus::Complete,
        }
    }

    #[inline]
    pub fn streaming_assistant(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            role: TurnRole::Assistant,
            content: String::new(),
            status: TurnStatus::Streaming,
        }
    }
}

/// A session with its turns in position order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    pub session: Session,
    pub turns: Vec<SessionTurn>,
}

impl Transcript {
    /// Completed turns as chat messages, oldest first
    #[inline]
    pub fn history(&self) -> Vec<ChatMessage> {
        self.turns
            .iter()
            .filter(|turn| turn.is_complete())
            .map(SessionTurn::to_message)
            .collect()
    }
}
