//! History manager — the session store plus in-memory shaping.
//!
//! Wraps the JSONL store with the process-wide message cap, token-budget
//! compaction, and tool-result pruning. Callers that need strict turn
//! ordering take the per-session lock around their whole
//! read → compact → call → append sequence.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use haya_core::config::ContextPruningConfig;
use haya_core::Message;
use haya_sessions::{Result, SessionStore};

use crate::pipeline::compact::{compact, drop_marker, CompactionOptions, Summarizer};
use crate::pipeline::prune::prune_tool_results;

#[derive(Debug, Clone, Default)]
pub struct HistoryOptions {
    /// When set, run token-budget compaction to fit this many tokens.
    pub max_tokens: Option<usize>,
    pub reserve_for_response: usize,
    pub recent_message_count: usize,
    pub system_prompt_tokens: usize,
    /// When set, run tool-result pruning after compaction.
    pub context_pruning: Option<ContextPruningConfig>,
}

pub struct HistoryManager {
    store: Arc<SessionStore>,
    /// Process-wide cap on messages fed to the model.
    max_messages: usize,
    /// Per-session turn-ordering locks, created on first use.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl HistoryManager {
    pub fn new(store: Arc<SessionStore>, max_messages: usize) -> Self {
        Self {
            store,
            max_messages,
            locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// The per-session mutex serializing read → compact → call → append.
    pub fn session_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn add_message(&self, id: &str, msg: &Message) -> Result<()> {
        self.store.append_message(id, msg)
    }

    pub fn add_messages(&self, id: &str, msgs: &[Message]) -> Result<()> {
        for m in msgs {
            self.store.append_message(id, m)?;
        }
        Ok(())
    }

    pub fn message_count(&self, id: &str) -> Result<usize> {
        match self.store.read_messages(id) {
            Ok(msgs) => Ok(msgs.len()),
            Err(haya_sessions::SessionError::NotFound(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Load and shape history. The dropped compaction prefix is replaced by
    /// a plain marker message.
    pub fn get_history(&self, id: &str, opts: &HistoryOptions) -> Result<Vec<Message>> {
        let mut messages = self.load_capped(id)?;
        if let Some(max_tokens) = opts.max_tokens {
            let out = compact(messages, &compaction_opts(max_tokens, opts));
            messages = out.kept;
            if !out.dropped.is_empty() {
                messages.insert(0, drop_marker(out.dropped.len()));
            }
        }
        self.apply_pruning(&mut messages, opts);
        Ok(messages)
    }

    /// Like `get_history`, but when a summarizer is supplied the dropped
    /// prefix becomes a single synthesized summary message. Summarization
    /// failure falls back to the plain marker inside the summarizer.
    pub async fn get_history_async(
        &self,
        id: &str,
        opts: &HistoryOptions,
        summarizer: Option<&Summarizer<'_>>,
    ) -> Result<Vec<Message>> {
        let mut messages = self.load_capped(id)?;
        if let Some(max_tokens) = opts.max_tokens {
            let out = compact(messages, &compaction_opts(max_tokens, opts));
            messages = out.kept;
            if !out.dropped.is_empty() {
                let lead = match summarizer {
                    Some(s) => s.summarize(&out.dropped).await,
                    None => drop_marker(out.dropped.len()),
                };
                messages.insert(0, lead);
            }
        }
        self.apply_pruning(&mut messages, opts);
        Ok(messages)
    }

    fn load_capped(&self, id: &str) -> Result<Vec<Message>> {
        let mut messages = match self.store.read_messages(id) {
            Ok(m) => m,
            Err(haya_sessions::SessionError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        if messages.len() > self.max_messages {
            let skip = messages.len() - self.max_messages;
            debug!(session = id, dropped = skip, "history over message cap");
            messages.drain(..skip);
        }
        Ok(messages)
    }

    fn apply_pruning(&self, messages: &mut [Message], opts: &HistoryOptions) {
        if let (Some(cfg), Some(max_tokens)) = (&opts.context_pruning, opts.max_tokens) {
            prune_tool_results(messages, cfg, max_tokens);
        }
    }
}

fn compaction_opts(max_tokens: usize, opts: &HistoryOptions) -> CompactionOptions {
    CompactionOptions {
        max_tokens,
        reserve_for_response: opts.reserve_for_response,
        recent_message_count: if opts.recent_message_count == 0 {
            10
        } else {
            opts.recent_message_count
        },
        system_prompt_tokens: opts.system_prompt_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tokens::estimate_messages;

    fn manager(max_messages: usize) -> (tempfile::TempDir, HistoryManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path().join("sessions")).unwrap());
        (dir, HistoryManager::new(store, max_messages))
    }

    #[test]
    fn history_is_suffix_under_message_cap() {
        let (_dir, mgr) = manager(3);
        for i in 0..10 {
            mgr.add_message("s", &Message::user(format!("m{i}"))).unwrap();
        }
        let history = mgr.get_history("s", &HistoryOptions::default()).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, "m7");
        assert_eq!(history[2].content, "m9");
    }

    #[test]
    fn missing_session_yields_empty_history() {
        let (_dir, mgr) = manager(100);
        let history = mgr.get_history("none", &HistoryOptions::default()).unwrap();
        assert!(history.is_empty());
        assert_eq!(mgr.message_count("none").unwrap(), 0);
    }

    #[test]
    fn compaction_inserts_marker_and_fits_budget() {
        let (_dir, mgr) = manager(100);
        for i in 0..20 {
            mgr.add_message("s", &Message::user(format!("{i} {}", "x".repeat(200))))
                .unwrap();
        }
        let opts = HistoryOptions {
            max_tokens: Some(300),
            recent_message_count: 4,
            ..Default::default()
        };
        let history = mgr.get_history("s", &opts).unwrap();
        assert!(history[0].content.contains("dropped/summarized"));
        // marker + kept tail fit within an order of the budget
        assert!(estimate_messages(&history[1..]) <= 300);
    }

    #[tokio::test]
    async fn async_history_without_summarizer_matches_sync() {
        let (_dir, mgr) = manager(100);
        for i in 0..20 {
            mgr.add_message("s", &Message::user(format!("{i} {}", "y".repeat(200))))
                .unwrap();
        }
        let opts = HistoryOptions {
            max_tokens: Some(300),
            recent_message_count: 4,
            ..Default::default()
        };
        let sync = mgr.get_history("s", &opts).unwrap();
        let asynch = mgr.get_history_async("s", &opts, None).await.unwrap();
        assert_eq!(sync.len(), asynch.len());
        assert!(asynch[0].content.contains("dropped/summarized"));
    }
}
