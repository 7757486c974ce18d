//! Context pipeline: token estimation, compaction, pruning, history
//! shaping, and the per-message processor every channel funnels into.

pub mod compact;
pub mod history;
pub mod process;
pub mod prune;
pub mod tokens;

pub use compact::{CompactionOptions, Summarizer};
pub use history::{HistoryManager, HistoryOptions};
pub use process::MessageProcessor;
pub use prune::PruneOutcome;
