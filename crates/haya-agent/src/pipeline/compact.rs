//! Token-budget compaction.
//!
//! Produces a message list whose estimated tokens fit
//! `max_tokens - reserve_for_response - system_prompt_tokens` while keeping
//! the latest turns intact. The dropped prefix is either replaced with a
//! marker or summarized through the provider.

use tracing::{debug, warn};

use haya_core::{Message, Role};

use crate::pipeline::tokens::{estimate_message, estimate_messages};
use crate::provider::{Provider, ProviderRequest};

#[derive(Debug, Clone)]
pub struct CompactionOptions {
    pub max_tokens: usize,
    pub reserve_for_response: usize,
    pub recent_message_count: usize,
    pub system_prompt_tokens: usize,
}

impl CompactionOptions {
    fn budget(&self) -> usize {
        self.max_tokens
            .saturating_sub(self.reserve_for_response)
            .saturating_sub(self.system_prompt_tokens)
    }
}

/// Result of the budget pass: the kept tail (with leading system message if
/// present) and the dropped prefix, in order.
pub struct Compacted {
    pub kept: Vec<Message>,
    pub dropped: Vec<Message>,
}

/// Drop the oldest contiguous prefix outside the keep set until the estimate
/// fits the budget. The keep set is the last `recent_message_count` messages
/// plus the first system message. A tool result is never separated from its
/// matching assistant call: the cut extends past orphaned tool messages.
pub fn compact(messages: Vec<Message>, opts: &CompactionOptions) -> Compacted {
    let budget = opts.budget();
    if estimate_messages(&messages) <= budget {
        return Compacted {
            kept: messages,
            dropped: Vec::new(),
        };
    }

    let first_system = messages.first().filter(|m| m.role == Role::System).cloned();
    let body_start = usize::from(first_system.is_some());
    let tail_start = messages
        .len()
        .saturating_sub(opts.recent_message_count)
        .max(body_start);

    // Minimal keep set: system + recent tail. If even that busts the
    // budget, return it unchanged — there is nothing left to drop.
    let mut minimal: Vec<Message> = Vec::new();
    minimal.extend(first_system.clone());
    minimal.extend_from_slice(&messages[tail_start..]);
    if estimate_messages(&minimal) > budget {
        debug!(
            estimate = estimate_messages(&minimal),
            budget, "keep set alone exceeds budget, returning it unchanged"
        );
        let dropped = messages[body_start..tail_start].to_vec();
        return Compacted {
            kept: minimal,
            dropped,
        };
    }

    // Advance the cut until the kept sequence fits.
    let system_tokens = first_system.as_ref().map(estimate_message).unwrap_or(0);
    let mut cut = body_start;
    loop {
        let kept_tokens = system_tokens + estimate_messages(&messages[cut..]);
        if kept_tokens <= budget || cut >= tail_start {
            break;
        }
        cut += 1;
        // never let a kept tool result precede its dropped assistant call
        while cut < tail_start && messages[cut].role == Role::Tool {
            cut += 1;
        }
    }

    let mut kept: Vec<Message> = Vec::new();
    kept.extend(first_system);
    kept.extend_from_slice(&messages[cut..]);
    let dropped = messages[body_start..cut].to_vec();
    Compacted { kept, dropped }
}

/// Marker message standing in for a dropped prefix.
pub fn drop_marker(count: usize) -> Message {
    Message::system(format!("[… {count} messages dropped/summarized …]"))
}

/// LLM summarization of a dropped prefix.
///
/// Chunks the prefix, asks the provider for a faithful compact summary per
/// chunk, merges multiple chunk summaries with one more call, and returns
/// the final text as a single synthetic system message. Any provider
/// failure falls back to the plain drop marker.
pub struct Summarizer<'a> {
    pub provider: &'a dyn Provider,
    pub model: String,
    pub reserve_tokens: usize,
}

const SUMMARY_SYSTEM_PROMPT: &str = "You summarize earlier turns of a conversation so the \
assistant can continue it with less context. Produce a faithful, compact summary of the \
messages below. Preserve stated facts, decisions, names, and open tasks. Do not invent \
content. Reply with the summary text only.";

const MERGE_SYSTEM_PROMPT: &str = "Merge the following partial conversation summaries into \
one faithful, compact summary. Reply with the merged summary text only.";

/// Tool output included in a summarization chunk is cut to this many chars.
const TOOL_SNIPPET_CHARS: usize = 2000;

impl<'a> Summarizer<'a> {
    pub async fn summarize(&self, dropped: &[Message]) -> Message {
        if dropped.is_empty() {
            return drop_marker(0);
        }
        match self.try_summarize(dropped).await {
            Ok(text) => Message::system(format!("Summary of earlier conversation:\n{text}")),
            Err(e) => {
                warn!(error = %e, "summarization failed, dropping prefix with marker");
                drop_marker(dropped.len())
            }
        }
    }

    async fn try_summarize(
        &self,
        dropped: &[Message],
    ) -> Result<String, crate::provider::ProviderError> {
        let chunk_budget = std::cmp::max(1000, self.reserve_tokens * 4);
        let chunks = chunk_by_tokens(dropped, chunk_budget);

        let mut partials = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let transcript = render_transcript(chunk);
            partials.push(self.call(SUMMARY_SYSTEM_PROMPT, &transcript).await?);
        }

        if partials.len() == 1 {
            return Ok(partials.pop().unwrap_or_default());
        }
        let joined = partials.join("\n\n---\n\n");
        self.call(MERGE_SYSTEM_PROMPT, &joined).await
    }

    async fn call(
        &self,
        system: &str,
        user: &str,
    ) -> Result<String, crate::provider::ProviderError> {
        let req = ProviderRequest {
            model: self.model.clone(),
            messages: vec![Message::system(system), Message::user(user)],
            tools: Vec::new(),
            max_tokens: 1024,
        };
        let resp = self.provider.complete(&req).await?;
        Ok(resp.message.content)
    }
}

fn chunk_by_tokens(messages: &[Message], budget: usize) -> Vec<Vec<Message>> {
    let mut chunks: Vec<Vec<Message>> = Vec::new();
    let mut current: Vec<Message> = Vec::new();
    let mut current_tokens = 0usize;
    for msg in messages {
        let t = estimate_message(msg);
        if !current.is_empty() && current_tokens + t > budget {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += t;
        current.push(msg.clone());
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn render_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let content = if m.role == Role::Tool {
                snippet(&m.content, TOOL_SNIPPET_CHARS)
            } else {
                m.content.clone()
            };
            format!("{}: {}", m.role, content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn snippet(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let head: String = s.chars().take(max_chars).collect();
    format!("{head}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use haya_core::ToolCall;

    fn opts(max_tokens: usize) -> CompactionOptions {
        CompactionOptions {
            max_tokens,
            reserve_for_response: 0,
            recent_message_count: 2,
            system_prompt_tokens: 0,
        }
    }

    fn filler(role: Role, chars: usize) -> Message {
        let content = "x".repeat(chars);
        match role {
            Role::User => Message::user(content),
            Role::Assistant => Message::assistant(content),
            Role::System => Message::system(content),
            Role::Tool => Message::tool_result("t", content),
        }
    }

    #[test]
    fn under_budget_passes_through() {
        let msgs = vec![Message::user("a"), Message::assistant("b")];
        let out = compact(msgs.clone(), &opts(10_000));
        assert_eq!(out.kept.len(), 2);
        assert!(out.dropped.is_empty());
    }

    #[test]
    fn drops_oldest_prefix_first() {
        let msgs = vec![
            filler(Role::User, 400),
            filler(Role::Assistant, 400),
            filler(Role::User, 40),
            filler(Role::Assistant, 40),
        ];
        let out = compact(msgs, &opts(60));
        assert_eq!(out.kept.len(), 2);
        assert_eq!(out.dropped.len(), 2);
        assert!(estimate_messages(&out.kept) <= 60);
    }

    #[test]
    fn first_system_message_is_always_kept() {
        let msgs = vec![
            Message::system("be brief"),
            filler(Role::User, 400),
            filler(Role::Assistant, 400),
            filler(Role::User, 20),
            filler(Role::Assistant, 20),
        ];
        let out = compact(msgs, &opts(60));
        assert_eq!(out.kept[0].role, Role::System);
        assert_eq!(out.kept[0].content, "be brief");
    }

    #[test]
    fn keep_set_over_budget_returned_unchanged() {
        let msgs = vec![
            filler(Role::User, 100),
            filler(Role::User, 4000),
            filler(Role::Assistant, 4000),
        ];
        let out = compact(msgs, &opts(50));
        // last two (recent_message_count) survive even though they bust the
        // budget
        assert_eq!(out.kept.len(), 2);
        assert!(estimate_messages(&out.kept) > 50);
    }

    #[test]
    fn cut_never_orphans_a_tool_result() {
        let call = ToolCall {
            id: "t9".into(),
            name: "search".into(),
            arguments: "{}".into(),
        };
        let msgs = vec![
            filler(Role::User, 200),
            Message::assistant_with_calls("x".repeat(200), vec![call]),
            Message::tool_result("t9", "y".repeat(200)),
            filler(Role::Assistant, 10),
            filler(Role::User, 10),
            filler(Role::Assistant, 10),
        ];
        let out = compact(msgs, &opts(40));
        // wherever the cut landed, no kept tool message may lack its
        // assistant call
        for (i, m) in out.kept.iter().enumerate() {
            if m.role == Role::Tool {
                let id = m.tool_call_id.as_deref().unwrap();
                let has_call = out.kept[..i].iter().any(|prev| {
                    prev.tool_calls
                        .as_ref()
                        .is_some_and(|cs| cs.iter().any(|c| c.id == id))
                });
                assert!(has_call, "kept tool result without its assistant call");
            }
        }
    }

    #[test]
    fn chunking_respects_budget() {
        let msgs: Vec<Message> = (0..10).map(|_| filler(Role::User, 400)).collect();
        let chunks = chunk_by_tokens(&msgs, 250);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            // single oversized messages still form their own chunk
            assert!(!chunk.is_empty());
        }
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn transcript_truncates_tool_output() {
        let msgs = vec![Message::tool_result("t", "z".repeat(5000))];
        let rendered = render_transcript(&msgs);
        assert!(rendered.chars().count() < 3000);
        assert!(rendered.ends_with('…'));
    }

    #[test]
    fn marker_counts_dropped_messages() {
        let m = drop_marker(12);
        assert_eq!(m.role, Role::System);
        assert!(m.content.contains("12 messages dropped/summarized"));
    }
}
