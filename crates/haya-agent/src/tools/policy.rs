//! Allow / confirm / deny resolution with an async approval hook.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use haya_core::config::ToolPolicyKind;

/// How long a confirm-mode approval may stay pending before it counts as a
/// denial.
const APPROVAL_TIMEOUT: Duration = Duration::from_secs(120);

/// Async approval hook: (tool name, parsed arguments) → approved?
pub type ApprovalCallback = Arc<
    dyn Fn(&str, &serde_json::Map<String, Value>) -> Pin<Box<dyn Future<Output = bool> + Send>>
        + Send
        + Sync,
>;

#[derive(Default)]
pub struct PolicyEngine {
    overrides: BTreeMap<String, ToolPolicyKind>,
    approval: Option<ApprovalCallback>,
}

impl PolicyEngine {
    pub fn new(
        overrides: BTreeMap<String, ToolPolicyKind>,
        approval: Option<ApprovalCallback>,
    ) -> Self {
        Self { overrides, approval }
    }

    pub fn override_for(&self, tool: &str) -> Option<ToolPolicyKind> {
        self.overrides.get(tool).copied()
    }

    /// Run the approval callback for a confirm-mode call. No callback, a
    /// falsy resolution, or a timeout all deny.
    pub async fn approve(&self, tool: &str, args: &serde_json::Map<String, Value>) -> bool {
        let Some(cb) = &self.approval else {
            warn!(tool, "confirm policy with no approval callback, denying");
            return false;
        };
        match tokio::time::timeout(APPROVAL_TIMEOUT, cb(tool, args)).await {
            Ok(approved) => approved,
            Err(_) => {
                warn!(tool, "approval timed out, denying");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn confirm_without_callback_denies() {
        let engine = PolicyEngine::default();
        assert!(!engine.approve("shell", &serde_json::Map::new()).await);
    }

    #[tokio::test]
    async fn callback_sees_tool_name_and_args() {
        let cb: ApprovalCallback = Arc::new(|name, args| {
            let ok = name == "shell" && args.get("cmd").is_some();
            Box::pin(async move { ok })
        });
        let engine = PolicyEngine::new(BTreeMap::new(), Some(cb));
        let mut args = serde_json::Map::new();
        args.insert("cmd".into(), serde_json::json!("ls"));
        assert!(engine.approve("shell", &args).await);
        assert!(!engine.approve("other", &args).await);
    }
}
