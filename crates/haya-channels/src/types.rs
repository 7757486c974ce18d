use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Metadata key under which the derived session key travels with a message.
pub const META_SESSION_KEY: &str = "session_key";

/// A normalized message received from any channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Plugin id (e.g. "telegram").
    pub channel: String,
    /// Platform-native conversation id (chat id, channel id, source name, …).
    pub channel_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Boundary-wrapped text (see haya_core::wrap).
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Carries at least `session_key` once derivation has run.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl InboundMessage {
    pub fn session_key(&self) -> Option<&str> {
        self.metadata.get(META_SESSION_KEY).and_then(|v| v.as_str())
    }
}

/// A message to deliver back through a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            thread_id: None,
        }
    }
}

/// What a plugin can do, surfaced through `channels.list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelCapabilities {
    /// e.g. ["dm", "group"].
    pub chat_types: Vec<String>,
    pub threads: bool,
    pub reactions: bool,
    pub media: bool,
}

/// Synchronous status snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_since: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
