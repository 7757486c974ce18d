use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use haya_core::{Message, ToolCall};

use crate::stream::StreamEvent;

/// Tool definition in the shape every backend consumes after translation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// Unified request to an LLM backend.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: String,
    /// Ordered conversation including system/user/assistant/tool roles.
    /// Adapters translate roles to their native shapes (system arrays,
    /// tool_use/tool_result blocks) and back.
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
}

/// Why the model stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.tokens_in += other.tokens_in;
        self.tokens_out += other.tokens_out;
    }
}

/// Unified response from an LLM backend.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// Assistant message; carries tool_calls when finish_reason is ToolCalls.
    pub message: Message,
    pub finish_reason: FinishReason,
    pub usage: Option<Usage>,
}

/// Common interface for all LLM backends (OpenAI-compatible, Anthropic,
/// Bedrock, Gemini).
#[async_trait]
pub trait Provider: Send + Sync {
    /// Backend name for logging, breaker keys and error messages.
    fn name(&self) -> &str;

    /// Send a request, wait for the full response.
    async fn complete(&self, req: &ProviderRequest) -> Result<ProviderResponse, ProviderError>;

    /// Stream the response through a channel, returning the final completed
    /// response. Default: falls back to non-streaming `complete` and emits
    /// the whole text as one delta.
    async fn complete_stream(
        &self,
        req: &ProviderRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<ProviderResponse, ProviderError> {
        let resp = self.complete(req).await?;
        if !resp.message.content.is_empty() {
            let _ = tx
                .send(StreamEvent::Delta {
                    content: resp.message.content.clone(),
                })
                .await;
        }
        Ok(resp)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        message: String,
        /// Parsed Retry-After hint, when the server sent one.
        retry_after_ms: Option<u64>,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("retries exhausted ({status}): {body}")]
    RetriesExhausted { status: u16, body: String },

    #[error("provider {0} unavailable: circuit open")]
    CircuitOpen(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Fold into the process-wide taxonomy at the gateway boundary.
    pub fn into_haya(self) -> haya_core::HayaError {
        match self {
            ProviderError::RetriesExhausted { status, body } => {
                haya_core::HayaError::RetryableProvider { status, body }
            }
            ProviderError::Api { status, message, .. } => haya_core::HayaError::ProviderHttp {
                status,
                body: message,
            },
            other => haya_core::HayaError::Internal(other.to_string()),
        }
    }
}

/// Extract assistant tool calls from a parsed message, preserving ids across
/// the provider hop.
pub fn tool_calls_of(msg: &Message) -> &[ToolCall] {
    msg.tool_calls.as_deref().unwrap_or(&[])
}
