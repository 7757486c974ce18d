//! Tool contract, registry and policy engine.
//!
//! Tools are registered once at startup; the registry is read-only
//! afterwards. Every call runs through policy resolution (allow / confirm /
//! deny), defensive argument parsing, a timeout ceiling and an output cap.
//! Tool failures are never fatal to the conversation: they become error
//! result strings the model sees on its next turn.

pub mod policy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use haya_core::config::ToolPolicyKind;
use haya_core::ToolCall;

use crate::provider::ToolDefinition;

pub use policy::{ApprovalCallback, PolicyEngine};

/// Longest tool result string handed back to the model.
pub const MAX_RESPONSE_LENGTH: usize = 16_000;
/// Ceiling on a single tool execution.
const EXECUTE_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
        }
    }
}

/// Trait every tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique, stable name.
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema for the tool's parameters.
    fn parameters(&self) -> Value;
    /// Policy applied when no per-tool override is configured.
    fn default_policy(&self) -> ToolPolicyKind {
        ToolPolicyKind::Allow
    }
    /// Execute with the parsed argument map. The map never leaks past this
    /// boundary; callers only see the result string.
    async fn execute(&self, args: serde_json::Map<String, Value>) -> ToolResult;
}

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    policy: PolicyEngine,
}

impl ToolRegistry {
    pub fn new(policy: PolicyEngine) -> Self {
        Self {
            tools: HashMap::new(),
            policy,
        }
    }

    /// Register a tool. Duplicate names replace the earlier registration.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn list(&self) -> Vec<&Arc<dyn Tool>> {
        let mut tools: Vec<_> = self.tools.values().collect();
        tools.sort_by_key(|t| t.name().to_string());
        tools
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    /// Effective policy for a tool: explicit override, else the tool's own
    /// default.
    pub fn effective_policy(&self, name: &str) -> ToolPolicyKind {
        self.policy.override_for(name).unwrap_or_else(|| {
            self.tools
                .get(name)
                .map(|t| t.default_policy())
                .unwrap_or(ToolPolicyKind::Deny)
        })
    }

    /// Tool definitions the model may call — denied tools are never offered.
    pub fn active_definitions(&self) -> Vec<ToolDefinition> {
        self.list()
            .into_iter()
            .filter(|t| self.effective_policy(t.name()) != ToolPolicyKind::Deny)
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect()
    }

    /// Run one tool call end to end: policy, parse, execute, cap.
    /// Always produces a result string for the transcript.
    pub async fn dispatch(&self, call: &ToolCall) -> ToolResult {
        let Some(tool) = self.tools.get(&call.name) else {
            return ToolResult::error(format!("Error: unknown tool: {}", call.name));
        };

        match self.effective_policy(&call.name) {
            ToolPolicyKind::Deny => {
                debug!(tool = %call.name, "tool call denied by policy");
                return ToolResult::error("Tool call denied by policy");
            }
            ToolPolicyKind::Confirm => {
                let args = match parse_arguments(&call.arguments) {
                    Ok(a) => a,
                    Err(e) => return ToolResult::error(e),
                };
                if !self.policy.approve(&call.name, &args).await {
                    debug!(tool = %call.name, "tool call not approved");
                    return ToolResult::error("Tool call denied by policy");
                }
                return self.execute_capped(tool, args).await;
            }
            ToolPolicyKind::Allow => {}
        }

        let args = match parse_arguments(&call.arguments) {
            Ok(a) => a,
            Err(e) => return ToolResult::error(e),
        };
        self.execute_capped(tool, args).await
    }

    async fn execute_capped(
        &self,
        tool: &Arc<dyn Tool>,
        args: serde_json::Map<String, Value>,
    ) -> ToolResult {
        let started = std::time::Instant::now();
        let result =
            match tokio::time::timeout(EXECUTE_TIMEOUT, tool.execute(args)).await {
                Ok(r) => r,
                Err(_) => {
                    warn!(tool = %tool.name(), "tool execution timed out");
                    ToolResult::error(format!(
                        "Error: tool {} timed out after {}s",
                        tool.name(),
                        EXECUTE_TIMEOUT.as_secs()
                    ))
                }
            };
        debug!(
            tool = %tool.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            is_error = result.is_error,
            "tool executed"
        );
        cap_result(result)
    }
}

/// Defensive JSON parse of the model-produced argument string.
/// Excess whitespace is tolerated; anything but a top-level object is an
/// error result.
pub fn parse_arguments(raw: &str) -> Result<serde_json::Map<String, Value>, String> {
    let trimmed = raw.trim();
    let source = if trimmed.is_empty() { "{}" } else { trimmed };
    match serde_json::from_str::<Value>(source) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!(
            "Error: tool arguments must be a JSON object, got {}",
            type_name(&other)
        )),
        Err(e) => Err(format!("Error: malformed tool arguments: {e}")),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn cap_result(mut result: ToolResult) -> ToolResult {
    let total = result.content.chars().count();
    if total <= MAX_RESPONSE_LENGTH {
        return result;
    }
    let kept: String = result.content.chars().take(MAX_RESPONSE_LENGTH).collect();
    result.content = format!("{kept}\n[Truncated — {total} chars total]");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input argument back"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({
                "type": "object",
                "properties": { "input": { "type": "string" } },
                "required": ["input"]
            })
        }
        async fn execute(&self, args: serde_json::Map<String, Value>) -> ToolResult {
            match args.get("input").and_then(|v| v.as_str()) {
                Some(s) => ToolResult::success(s),
                None => ToolResult::error("Error: missing input"),
            }
        }
    }

    struct PanickyTool;

    #[async_trait]
    impl Tool for PanickyTool {
        fn name(&self) -> &str {
            "boom"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _args: serde_json::Map<String, Value>) -> ToolResult {
            ToolResult::error("Error: kaput")
        }
    }

    struct BigTool;

    #[async_trait]
    impl Tool for BigTool {
        fn name(&self) -> &str {
            "big"
        }
        fn description(&self) -> &str {
            "Returns a huge string"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _args: serde_json::Map<String, Value>) -> ToolResult {
            ToolResult::success("x".repeat(MAX_RESPONSE_LENGTH + 500))
        }
    }

    fn registry(policy: PolicyEngine) -> ToolRegistry {
        let mut r = ToolRegistry::new(policy);
        r.register(Arc::new(EchoTool));
        r.register(Arc::new(PanickyTool));
        r.register(Arc::new(BigTool));
        r
    }

    fn call(name: &str, args: &str) -> ToolCall {
        ToolCall {
            id: "t1".into(),
            name: name.into(),
            arguments: args.into(),
        }
    }

    #[tokio::test]
    async fn allow_executes_immediately() {
        let r = registry(PolicyEngine::default());
        let result = r.dispatch(&call("echo", r#"{"input":"hi"}"#)).await;
        assert!(!result.is_error);
        assert_eq!(result.content, "hi");
    }

    #[tokio::test]
    async fn unknown_tool_is_error_result() {
        let r = registry(PolicyEngine::default());
        let result = r.dispatch(&call("nope", "{}")).await;
        assert!(result.is_error);
        assert!(result.content.contains("unknown tool"));
    }

    #[tokio::test]
    async fn malformed_arguments_become_error_result() {
        let r = registry(PolicyEngine::default());
        let result = r.dispatch(&call("echo", "{not json")).await;
        assert!(result.is_error);
        assert!(result.content.contains("malformed"));
    }

    #[tokio::test]
    async fn non_object_arguments_rejected() {
        let r = registry(PolicyEngine::default());
        let result = r.dispatch(&call("echo", "[1,2,3]")).await;
        assert!(result.is_error);
        assert!(result.content.contains("must be a JSON object"));
    }

    #[tokio::test]
    async fn whitespace_around_arguments_tolerated() {
        let r = registry(PolicyEngine::default());
        let result = r.dispatch(&call("echo", "   {\"input\":\"ok\"}  \n")).await;
        assert_eq!(result.content, "ok");
    }

    #[tokio::test]
    async fn deny_override_never_executes() {
        let mut policies = std::collections::BTreeMap::new();
        policies.insert("echo".to_string(), ToolPolicyKind::Deny);
        let r = registry(PolicyEngine::new(policies, None));
        let result = r.dispatch(&call("echo", r#"{"input":"hi"}"#)).await;
        assert!(result.is_error);
        assert_eq!(result.content, "Tool call denied by policy");
        // denied tools are not offered to the model at all
        assert!(r.active_definitions().iter().all(|d| d.name != "echo"));
    }

    #[tokio::test]
    async fn confirm_with_rejecting_callback_denies() {
        let mut policies = std::collections::BTreeMap::new();
        policies.insert("echo".to_string(), ToolPolicyKind::Confirm);
        let cb: ApprovalCallback = Arc::new(|_, _| Box::pin(async { false }));
        let r = registry(PolicyEngine::new(policies, Some(cb)));
        let result = r.dispatch(&call("echo", r#"{"input":"hi"}"#)).await;
        assert!(result.is_error);
        assert_eq!(result.content, "Tool call denied by policy");
    }

    #[tokio::test]
    async fn confirm_with_approving_callback_executes() {
        let mut policies = std::collections::BTreeMap::new();
        policies.insert("echo".to_string(), ToolPolicyKind::Confirm);
        let cb: ApprovalCallback = Arc::new(|_, _| Box::pin(async { true }));
        let r = registry(PolicyEngine::new(policies, Some(cb)));
        let result = r.dispatch(&call("echo", r#"{"input":"hi"}"#)).await;
        assert_eq!(result.content, "hi");
    }

    #[tokio::test]
    async fn oversized_result_is_truncated_with_marker() {
        let r = registry(PolicyEngine::default());
        let result = r.dispatch(&call("big", "{}")).await;
        assert!(result.content.len() < MAX_RESPONSE_LENGTH + 100);
        assert!(result
            .content
            .contains(&format!("[Truncated — {} chars total]", MAX_RESPONSE_LENGTH + 500)));
    }

    #[tokio::test]
    async fn tool_errors_flow_back_as_error_results() {
        let r = registry(PolicyEngine::default());
        let result = r.dispatch(&call("boom", "{}")).await;
        assert!(result.is_error);
        assert!(result.content.starts_with("Error: "));
    }
}
