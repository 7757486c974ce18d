use serde::{Deserialize, Serialize};

use haya_core::Message;

/// Metadata record — always the first line of a session file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
}

impl SessionMeta {
    pub fn new(title: Option<String>, model: Option<String>) -> Self {
        Self {
            title,
            model,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// One line of a session file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEntry {
    Meta(SessionMeta),
    Message(Message),
}

/// Derived listing view over a session file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionListItem {
    pub id: String,
    pub title: Option<String>,
    pub created_at: i64,
    /// Max entry timestamp, or created_at when the session has no messages.
    pub updated_at: i64,
    pub message_count: usize,
}
