//! The tool-calling conversation loop.
//!
//! provider call → tool dispatch → result append → repeat until the model
//! stops or the loop bound is hit. Retry and the circuit breaker wrap every
//! provider call. The runtime never persists anything; callers decide what
//! to append to the session from the returned transcript.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use haya_core::Message;

use crate::breaker::CircuitBreaker;
use crate::provider::{
    FinishReason, Provider, ProviderError, ProviderRequest, ProviderResponse, Usage,
};
use crate::retry::{with_retry, RetryOptions};
use crate::stream::StreamEvent;
use crate::tools::ToolRegistry;

/// Default bound on provider → tool → provider round trips per chat call.
pub const DEFAULT_MAX_TOOL_LOOPS: usize = 8;
/// Characters of a tool result surfaced in streaming events.
const RESULT_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct ChatParams {
    pub session_id: String,
    /// The already-wrapped user message for this turn.
    pub message: Message,
    pub model: Option<String>,
    /// Request-scoped tool definitions offered alongside the registry's.
    /// Calls to these come back as unknown-tool error results unless an
    /// executor with the same name is registered.
    pub extra_tools: Vec<crate::provider::ToolDefinition>,
}

/// Outcome of one chat call.
#[derive(Debug)]
pub struct ChatOutcome {
    /// Final assistant message.
    pub message: Message,
    pub usage: Option<Usage>,
    pub finish_reason: FinishReason,
    /// Every message the loop produced after the user turn, in order:
    /// assistant tool-call turns, tool results, and the final assistant
    /// message. Callers append these to the session.
    pub transcript: Vec<Message>,
}

pub struct AgentRuntime {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryOptions,
    system_prompt: Option<String>,
    default_model: String,
    max_tool_loops: usize,
    max_tokens: u32,
}

impl AgentRuntime {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        breaker: Arc<CircuitBreaker>,
        system_prompt: Option<String>,
        default_model: String,
    ) -> Self {
        Self {
            provider,
            tools,
            breaker,
            retry: RetryOptions::default(),
            system_prompt: system_prompt.filter(|s| !s.is_empty()),
            default_model,
            max_tool_loops: DEFAULT_MAX_TOOL_LOOPS,
            max_tokens: 4096,
        }
    }

    pub fn with_retry_options(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_tool_loops(mut self, bound: usize) -> Self {
        self.max_tool_loops = bound;
        self
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Non-streaming chat call.
    pub async fn chat(
        &self,
        params: ChatParams,
        history: Vec<Message>,
    ) -> Result<ChatOutcome, ProviderError> {
        self.chat_inner(params, history, None).await
    }

    /// Streaming chat call — deltas and tool events flow through `tx`; the
    /// terminal value is the same outcome as `chat`.
    pub async fn chat_stream(
        &self,
        params: ChatParams,
        history: Vec<Message>,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<ChatOutcome, ProviderError> {
        self.chat_inner(params, history, Some(tx)).await
    }

    async fn chat_inner(
        &self,
        params: ChatParams,
        history: Vec<Message>,
        tx: Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<ChatOutcome, ProviderError> {
        let model = params
            .model
            .unwrap_or_else(|| self.default_model.clone());

        let mut working: Vec<Message> = Vec::with_capacity(history.len() + 2);
        if let Some(sp) = &self.system_prompt {
            working.push(Message::system(sp.clone()));
        }
        working.extend(history);
        working.push(params.message);

        let mut tool_defs = self.tools.active_definitions();
        tool_defs.extend(params.extra_tools);
        let mut transcript: Vec<Message> = Vec::new();
        let mut usage = Usage::default();
        let mut saw_usage = false;

        for iteration in 0..self.max_tool_loops {
            let req = ProviderRequest {
                model: model.clone(),
                messages: working.clone(),
                tools: tool_defs.clone(),
                max_tokens: self.max_tokens,
            };
            debug!(session = %params.session_id, iteration, "provider call");
            let resp = self.call_provider(&req, tx.as_ref()).await?;
            if let Some(u) = resp.usage {
                usage.add(u);
                saw_usage = true;
            }

            match resp.finish_reason {
                FinishReason::Stop | FinishReason::Length => {
                    info!(
                        session = %params.session_id,
                        iteration,
                        finish = ?resp.finish_reason,
                        "chat complete"
                    );
                    transcript.push(resp.message.clone());
                    return Ok(ChatOutcome {
                        message: resp.message,
                        usage: saw_usage.then_some(usage),
                        finish_reason: resp.finish_reason,
                        transcript,
                    });
                }
                FinishReason::ToolCalls => {
                    let assistant = resp.message;
                    let calls = assistant.tool_calls.clone().unwrap_or_default();
                    let mut results: Vec<Message> = Vec::with_capacity(calls.len());

                    for call in &calls {
                        if let Some(tx) = &tx {
                            let _ = tx
                                .send(StreamEvent::ToolCallStart {
                                    id: call.id.clone(),
                                    name: call.name.clone(),
                                })
                                .await;
                        }
                        let result = self.tools.dispatch(call).await;
                        if let Some(tx) = &tx {
                            let _ = tx
                                .send(StreamEvent::ToolResult {
                                    id: call.id.clone(),
                                    excerpt: excerpt(&result.content),
                                })
                                .await;
                        }
                        results.push(Message::tool_result(&call.id, result.content));
                    }

                    // append once, after processing every call in the turn
                    working.push(assistant.clone());
                    transcript.push(assistant);
                    for r in results {
                        working.push(r.clone());
                        transcript.push(r);
                    }
                }
            }
        }

        warn!(
            session = %params.session_id,
            bound = self.max_tool_loops,
            "tool loop limit reached"
        );
        let fallback = Message::assistant("Tool loop limit reached");
        transcript.push(fallback.clone());
        Ok(ChatOutcome {
            message: fallback,
            usage: saw_usage.then_some(usage),
            finish_reason: FinishReason::Stop,
            transcript,
        })
    }

    async fn call_provider(
        &self,
        req: &ProviderRequest,
        tx: Option<&mpsc::Sender<StreamEvent>>,
    ) -> Result<ProviderResponse, ProviderError> {
        let name = self.provider.name().to_string();
        if !self.breaker.is_available(&name) {
            return Err(ProviderError::CircuitOpen(name));
        }

        let result = with_retry(&self.retry, || async {
            match tx {
                Some(tx) => self.provider.complete_stream(req, tx.clone()).await,
                None => self.provider.complete(req).await,
            }
        })
        .await;

        match &result {
            Ok(_) => self.breaker.record_success(&name),
            Err(ProviderError::CircuitOpen(_)) => {}
            Err(_) => self.breaker.record_failure(&name),
        }
        result
    }
}

fn excerpt(content: &str) -> String {
    if content.chars().count() <= RESULT_EXCERPT_CHARS {
        content.to_string()
    } else {
        content.chars().take(RESULT_EXCERPT_CHARS).collect()
    }
}
