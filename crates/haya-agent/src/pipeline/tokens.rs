//! Cheap deterministic token estimation.
//!
//! Roughly four characters per token plus a small per-message overhead.
//! The estimate only has to be stable and monotonic in content size; the
//! compaction budget math treats it as the unit of account.

use haya_core::Message;

/// Fixed per-message overhead (role, framing).
const MESSAGE_OVERHEAD: usize = 4;

pub fn estimate_message(msg: &Message) -> usize {
    let mut chars = msg.content.chars().count();
    if let Some(calls) = &msg.tool_calls {
        for c in calls {
            chars += c.name.len() + c.arguments.chars().count();
        }
    }
    MESSAGE_OVERHEAD + chars.div_ceil(4)
}

pub fn estimate_messages(msgs: &[Message]) -> usize {
    msgs.iter().map(estimate_message).sum()
}

/// Estimate for a raw string, used for system prompts.
pub fn estimate_text(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use haya_core::ToolCall;

    #[test]
    fn estimate_is_deterministic_and_monotonic() {
        let short = Message::user("hi");
        let long = Message::user("hi".repeat(100));
        assert_eq!(estimate_message(&short), estimate_message(&short));
        assert!(estimate_message(&long) > estimate_message(&short));
    }

    #[test]
    fn tool_call_arguments_count() {
        let plain = Message::assistant("x");
        let with_call = Message::assistant_with_calls(
            "x",
            vec![ToolCall {
                id: "t".into(),
                name: "search".into(),
                arguments: "{\"q\":\"a long query string here\"}".into(),
            }],
        );
        assert!(estimate_message(&with_call) > estimate_message(&plain));
    }

    #[test]
    fn list_estimate_is_sum() {
        let msgs = vec![Message::user("a"), Message::assistant("b")];
        assert_eq!(
            estimate_messages(&msgs),
            estimate_message(&msgs[0]) + estimate_message(&msgs[1])
        );
    }
}
