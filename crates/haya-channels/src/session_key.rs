//! Per-channel-family session-key derivation.
//!
//! The key uniquely identifies one conversation thread. Derivation keeps the
//! platform ids verbatim; only the file boundary maps `:` to `-`, and the
//! session store's charset check remains the final gate for anything odd a
//! platform id may carry.

use haya_core::SessionKey;

use crate::types::InboundMessage;

/// Derive the session key for an inbound message according to its channel
/// family. Unknown channels fall back to `<channel>:<channelId>`.
pub fn derive_session_key(msg: &InboundMessage) -> SessionKey {
    let channel = msg.channel.as_str();
    let dm = is_direct(msg);

    let key = match channel {
        "slack" => {
            if dm {
                format!("slack:dm:{}", msg.sender_id)
            } else {
                // Threads anchor the conversation; top-level messages use
                // their own ts carried as the thread id by the adapter.
                let thread = msg.thread_id.as_deref().unwrap_or(&msg.channel_id);
                format!("slack:channel:{}:{}", msg.channel_id, thread)
            }
        }
        "discord" => {
            if dm {
                format!("discord:dm:{}", msg.sender_id)
            } else {
                format!("discord:channel:{}", msg.channel_id)
            }
        }
        "telegram" => {
            if dm {
                format!("telegram:dm:{}", msg.channel_id)
            } else {
                format!("telegram:chat:{}", msg.channel_id)
            }
        }
        "matrix" => {
            if dm {
                format!("matrix:dm:{}", msg.sender_id)
            } else {
                format!("matrix:room:{}", msg.channel_id)
            }
        }
        "teams" => {
            if dm {
                format!("teams:dm:{}", msg.sender_id)
            } else {
                format!("teams:channel:{}", msg.channel_id)
            }
        }
        "whatsapp" => format!("whatsapp:dm:{}", msg.sender_id),
        "webhook" => format!("webhook:{}", msg.channel_id),
        "webchat" => format!("webchat:{}", msg.channel_id),
        other => format!("{}:{}", other, msg.channel_id),
    };

    SessionKey::new(key)
}

fn is_direct(msg: &InboundMessage) -> bool {
    msg.metadata
        .get("chat_type")
        .and_then(|v| v.as_str())
        .map(|t| matches!(t, "dm" | "direct" | "personal" | "private"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn msg(channel: &str, channel_id: &str, sender: &str, chat_type: Option<&str>) -> InboundMessage {
        let mut metadata = BTreeMap::new();
        if let Some(t) = chat_type {
            metadata.insert("chat_type".into(), serde_json::json!(t));
        }
        InboundMessage {
            channel: channel.into(),
            channel_id: channel_id.into(),
            sender_id: sender.into(),
            sender_name: None,
            content: String::new(),
            thread_id: None,
            timestamp: 0,
            metadata,
        }
    }

    #[test]
    fn slack_thread_key() {
        let mut m = msg("slack", "C42", "U7", None);
        m.thread_id = Some("1700.123".into());
        assert_eq!(derive_session_key(&m).as_str(), "slack:channel:C42:1700.123");
    }

    #[test]
    fn slack_dm_key() {
        let m = msg("slack", "D9", "U7", Some("dm"));
        assert_eq!(derive_session_key(&m).as_str(), "slack:dm:U7");
    }

    #[test]
    fn discord_guild_ignores_thread() {
        let m = msg("discord", "555", "u1", None);
        assert_eq!(derive_session_key(&m).as_str(), "discord:channel:555");
    }

    #[test]
    fn telegram_keys_use_chat_id_even_for_dm() {
        let dm = msg("telegram", "9001", "u1", Some("private"));
        assert_eq!(derive_session_key(&dm).as_str(), "telegram:dm:9001");
        let group = msg("telegram", "9002", "u1", None);
        assert_eq!(derive_session_key(&group).as_str(), "telegram:chat:9002");
    }

    #[test]
    fn whatsapp_is_always_dm() {
        let m = msg("whatsapp", "whatever", "31612345678", None);
        assert_eq!(derive_session_key(&m).as_str(), "whatsapp:dm:31612345678");
    }

    #[test]
    fn webhook_uses_source_name() {
        let m = msg("webhook", "github", "-", None);
        assert_eq!(derive_session_key(&m).as_str(), "webhook:github");
    }

    #[test]
    fn matrix_room_id_survives_derivation_untouched() {
        // The '!' survives here; the session store's charset check is the
        // gate that ultimately rejects it as a filename.
        let m = msg("matrix", "!abc:example.org", "@bob:example.org", None);
        let key = derive_session_key(&m);
        assert_eq!(key.as_str(), "matrix:room:!abc:example.org");
        assert_eq!(key.file_id(), "matrix-room-!abc-example.org");
    }

    #[test]
    fn unknown_channel_falls_back() {
        let m = msg("pager", "oncall", "u1", None);
        assert_eq!(derive_session_key(&m).as_str(), "pager:oncall");
    }
}
