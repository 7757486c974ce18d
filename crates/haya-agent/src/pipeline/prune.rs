//! Tool-result pruning — separate from compaction.
//!
//! When the conversation's character footprint crosses configured ratios of
//! the window, old tool results are first trimmed (head + tail) and then,
//! past the hard ratio, replaced outright. Bootstrap messages (before the
//! first user turn) and the protected tail are never touched.

use haya_core::{Message, Role};

use haya_core::config::ContextPruningConfig;

/// Fixed placeholder standing in for a hard-cleared tool result.
const CLEARED_PLACEHOLDER: &str = "[Old tool result removed to free context]";
const TRIM_MARKER: &str = "[Tool result trimmed]";
/// Head/tail kept when soft-trimming.
const TRIM_HEAD_CHARS: usize = 800;
const TRIM_TAIL_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneOutcome {
    /// Below every threshold — the list was not touched.
    Untouched,
    SoftTrimmed(usize),
    HardCleared(usize),
}

/// Apply pruning in place. `max_tokens` anchors the ratio thresholds
/// (`max_tokens * 4` chars is treated as the full window).
pub fn prune_tool_results(
    messages: &mut [Message],
    cfg: &ContextPruningConfig,
    max_tokens: usize,
) -> PruneOutcome {
    let max_chars = max_tokens.saturating_mul(4);
    if max_chars == 0 {
        return PruneOutcome::Untouched;
    }
    let current_chars: usize = messages.iter().map(|m| m.content.chars().count()).sum();
    let ratio = current_chars as f64 / max_chars as f64;
    if ratio <= cfg.soft_trim_ratio {
        return PruneOutcome::Untouched;
    }

    let Some(window) = prunable_window(messages, cfg.keep_last_assistants) else {
        return PruneOutcome::Untouched;
    };

    let prunable_tool_chars: usize = messages[window.clone()]
        .iter()
        .filter(|m| m.role == Role::Tool)
        .map(|m| m.content.chars().count())
        .sum();

    if ratio > cfg.hard_clear_ratio && prunable_tool_chars >= cfg.min_prunable_tool_chars {
        let mut cleared = 0;
        for m in &mut messages[window] {
            if m.role == Role::Tool && m.content != CLEARED_PLACEHOLDER {
                m.content = CLEARED_PLACEHOLDER.to_string();
                cleared += 1;
            }
        }
        return if cleared > 0 {
            PruneOutcome::HardCleared(cleared)
        } else {
            PruneOutcome::Untouched
        };
    }

    let mut trimmed = 0;
    for m in &mut messages[window] {
        if m.role == Role::Tool {
            if let Some(shorter) = trim_head_tail(&m.content) {
                m.content = shorter;
                trimmed += 1;
            }
        }
    }
    if trimmed > 0 {
        PruneOutcome::SoftTrimmed(trimmed)
    } else {
        PruneOutcome::Untouched
    }
}

/// Indices strictly between the first user message and the Nth-from-last
/// assistant message. None when no such window exists.
fn prunable_window(
    messages: &[Message],
    keep_last_assistants: usize,
) -> Option<std::ops::Range<usize>> {
    let first_user = messages.iter().position(|m| m.role == Role::User)?;

    let assistant_positions: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::Assistant)
        .map(|(i, _)| i)
        .collect();
    if assistant_positions.len() < keep_last_assistants {
        return None;
    }
    let cutoff = assistant_positions[assistant_positions.len() - keep_last_assistants];

    let start = first_user + 1;
    (start < cutoff).then_some(start..cutoff)
}

fn trim_head_tail(content: &str) -> Option<String> {
    let total = content.chars().count();
    if total <= TRIM_HEAD_CHARS + TRIM_TAIL_CHARS {
        return None;
    }
    let head: String = content.chars().take(TRIM_HEAD_CHARS).collect();
    let tail: String = content
        .chars()
        .skip(total - TRIM_TAIL_CHARS)
        .collect();
    Some(format!("{TRIM_MARKER}\n{head}\n…\n{tail}"))
}
