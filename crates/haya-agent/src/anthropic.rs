//! Anthropic Messages API driver.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use haya_core::{Message, Role, ToolCall};

use crate::provider::{
    FinishReason, Provider, ProviderError, ProviderRequest, ProviderResponse, Usage,
};
use crate::retry::parse_retry_after;
use crate::stream::{parse_sse_line, SseParsed, StreamEvent};

const API_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".to_string()),
        }
    }

    fn request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(body)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, req: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let body = build_request_body(req);
        debug!(model = %req.model, "sending request to Anthropic");

        let resp = self.request(&body).send().await?;
        let resp = check_status(resp).await?;

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(parse_response(api_resp))
    }

    async fn complete_stream(
        &self,
        req: &ProviderRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<ProviderResponse, ProviderError> {
        let mut body = build_request_body(req);
        body["stream"] = serde_json::json!(true);
        debug!(model = %req.model, "sending streaming request to Anthropic");

        let resp = self.request(&body).send().await?;
        let resp = check_status(resp).await?;
        read_sse_stream(resp, tx).await
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status().as_u16();
    if resp.status().is_success() {
        return Ok(resp);
    }
    let retry_after_ms = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let text = resp.text().await.unwrap_or_default();
    warn!(status, body = %text, "Anthropic API error");
    Err(ProviderError::Api {
        status,
        message: text,
        retry_after_ms,
    })
}

/// Translate the unified request into Messages API shape: system messages
/// join the `system` field, tool results become user-role tool_result
/// blocks, assistant tool calls become tool_use blocks.
pub(crate) fn build_request_body(req: &ProviderRequest) -> serde_json::Value {
    let system: String = req
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut messages: Vec<serde_json::Value> = Vec::new();
    for m in &req.messages {
        match m.role {
            Role::System => {}
            Role::User => {
                messages.push(serde_json::json!({ "role": "user", "content": m.content }));
            }
            Role::Assistant => {
                let mut blocks: Vec<serde_json::Value> = Vec::new();
                if !m.content.is_empty() {
                    blocks.push(serde_json::json!({ "type": "text", "text": m.content }));
                }
                for call in m.tool_calls.as_deref().unwrap_or(&[]) {
                    let input: serde_json::Value =
                        serde_json::from_str(&call.arguments).unwrap_or(serde_json::json!({}));
                    blocks.push(serde_json::json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": input,
                    }));
                }
                messages.push(serde_json::json!({ "role": "assistant", "content": blocks }));
            }
            Role::Tool => {
                messages.push(serde_json::json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": m.tool_call_id.clone().unwrap_or_default(),
                        "content": m.content,
                    }],
                }));
            }
        }
    }

    let mut body = serde_json::json!({
        "model": req.model,
        "max_tokens": req.max_tokens,
        "messages": messages,
    });
    if !system.is_empty() {
        body["system"] = serde_json::json!(system);
    }
    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();
        body["tools"] = serde_json::json!(tools);
    }
    body
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
    id: Option<String>,
    name: Option<String>,
    input: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ApiUsage {
    input_tokens: u64,
    output_tokens: u64,
}

fn parse_response(api: ApiResponse) -> ProviderResponse {
    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    for block in api.content {
        match block.block_type.as_str() {
            "text" => {
                if let Some(t) = block.text {
                    text.push_str(&t);
                }
            }
            "tool_use" => {
                let input = block.input.unwrap_or(serde_json::json!({}));
                tool_calls.push(ToolCall {
                    id: block.id.unwrap_or_default(),
                    name: block.name.unwrap_or_default(),
                    arguments: serde_json::to_string(&input).unwrap_or_else(|_| "{}".into()),
                });
            }
            _ => {}
        }
    }

    let finish_reason = map_finish(api.stop_reason.as_deref(), !tool_calls.is_empty());
    let message = if tool_calls.is_empty() {
        Message::assistant(text)
    } else {
        Message::assistant_with_calls(text, tool_calls)
    };

    ProviderResponse {
        message,
        finish_reason,
        usage: api.usage.map(|u| Usage {
            tokens_in: u.input_tokens,
            tokens_out: u.output_tokens,
        }),
    }
}

fn map_finish(stop_reason: Option<&str>, has_tool_calls: bool) -> FinishReason {
    match stop_reason {
        Some("tool_use") => FinishReason::ToolCalls,
        Some("max_tokens") => FinishReason::Length,
        _ if has_tool_calls => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}

// --- streaming --------------------------------------------------------------

#[derive(Default)]
struct ToolUseBuilder {
    id: String,
    name: String,
    input_json: String,
}

async fn read_sse_stream(
    resp: reqwest::Response,
    tx: mpsc::Sender<StreamEvent>,
) -> Result<ProviderResponse, ProviderError> {
    let mut stream = resp.bytes_stream();
    let mut buffer = String::new();
    let mut text = String::new();
    let mut builders: Vec<ToolUseBuilder> = Vec::new();
    let mut stop_reason: Option<String> = None;
    let mut tokens_in = 0u64;
    let mut tokens_out = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(ProviderError::Http)?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].trim_end().to_string();
            buffer.drain(..=pos);
            let Some(SseParsed::Data(data)) = parse_sse_line(line.trim()) else {
                continue;
            };
            let Ok(ev) = serde_json::from_str::<StreamSseEvent>(&data) else {
                continue;
            };
            match ev.event_type.as_str() {
                "message_start" => {
                    if let Some(u) = ev.message.and_then(|m| m.usage) {
                        tokens_in = u.input_tokens.unwrap_or(0);
                    }
                }
                "content_block_start" => {
                    if let Some(block) = ev.content_block {
                        if block.block_type == "tool_use" {
                            builders.push(ToolUseBuilder {
                                id: block.id.unwrap_or_default(),
                                name: block.name.clone().unwrap_or_default(),
                                input_json: String::new(),
                            });
                        }
                    }
                }
                "content_block_delta" => {
                    if let Some(delta) = ev.delta {
                        if let Some(t) = delta.text {
                            text.push_str(&t);
                            let _ = tx.send(StreamEvent::Delta { content: t }).await;
                        }
                        if let Some(partial) = delta.partial_json {
                            if let Some(b) = builders.last_mut() {
                                b.input_json.push_str(&partial);
                            }
                        }
                    }
                }
                "message_delta" => {
                    if let Some(delta) = ev.delta {
                        if let Some(reason) = delta.stop_reason {
                            stop_reason = Some(reason);
                        }
                    }
                    if let Some(u) = ev.usage {
                        tokens_out = u.output_tokens.unwrap_or(0);
                    }
                }
                _ => {}
            }
        }
    }

    let tool_calls: Vec<ToolCall> = builders
        .into_iter()
        .filter(|b| !b.name.is_empty())
        .map(|b| ToolCall {
            id: b.id,
            name: b.name,
            arguments: if b.input_json.is_empty() {
                "{}".to_string()
            } else {
                b.input_json
            },
        })
        .collect();

    let finish_reason = map_finish(stop_reason.as_deref(), !tool_calls.is_empty());
    let message = if tool_calls.is_empty() {
        Message::assistant(text)
    } else {
        Message::assistant_with_calls(text, tool_calls)
    };

    Ok(ProviderResponse {
        message,
        finish_reason,
        usage: Some(Usage {
            tokens_in,
            tokens_out,
        }),
    })
}

#[derive(Deserialize)]
struct StreamSseEvent {
    #[serde(rename = "type")]
    event_type: String,
    message: Option<StreamMessage>,
    content_block: Option<ContentBlock>,
    delta: Option<StreamDelta>,
    usage: Option<StreamUsage>,
}

#[derive(Deserialize)]
struct StreamMessage {
    usage: Option<StreamUsage>,
}

#[derive(Deserialize)]
struct StreamDelta {
    text: Option<String>,
    partial_json: Option<String>,
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}
