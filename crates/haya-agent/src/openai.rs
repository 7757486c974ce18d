//! OpenAI-compatible chat completions driver (OpenAI itself plus any
//! compatible endpoint).

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
use crate::stream::StreamEvent;

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    provider_name: String,
    chat_path: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self::with_path(
            "openai",
            api_key,
            base_url.unwrap_or_else(|| "https://api.openai.com".to_string()),
            "/v1/chat/completions".to_string(),
        )
    }

    /// Named OpenAI-compatible endpoint with a custom completions path.
    pub fn with_path(
        name: impl Into<String>,
        api_key: String,
        base_url: String,
        chat_path: String,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            provider_name: name.into(),
            api_key,
            base_url,
            chat_path,
        }
    }

    fn url(&self) -> String {
        format!("{}{}", self.base_url, self.chat_path)
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn complete(&self, req: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let body = build_request_body(req, false);
        debug!(model = %req.model, provider = %self.provider_name, "sending request");

        let resp = self
            .client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let resp = check_status(resp).await?;
        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        parse_response(api_resp)
    }

    async fn complete_stream(
        &self,
        req: &ProviderRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<ProviderResponse, ProviderError> {
        let body = build_request_body(req, true);
        debug!(model = %req.model, provider = %self.provider_name, "sending streaming request");

        let resp = self
            .client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

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
    warn!(status, body = %text, "OpenAI-compatible API error");
    Err(ProviderError::Api {
        status,
        message: text,
        retry_after_ms,
    })
}

fn build_request_body(req: &ProviderRequest, stream: bool) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req.messages.iter().map(message_to_json).collect();

    let mut body = serde_json::json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.max_tokens,
    });
    if stream {
        body["stream"] = serde_json::json!(true);
    }
    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        body["tools"] = serde_json::json!(tools);
    }
    body
}

fn message_to_json(m: &Message) -> serde_json::Value {
    match m.role {
        Role::System => serde_json::json!({ "role": "system", "content": m.content }),
        Role::User => serde_json::json!({ "role": "user", "content": m.content }),
        Role::Assistant => {
            let mut msg = serde_json::json!({ "role": "assistant", "content": m.content });
            if let Some(calls) = &m.tool_calls {
                let calls_json: Vec<serde_json::Value> = calls
                    .iter()
                    .map(|c| {
                        serde_json::json!({
                            "id": c.id,
                            "type": "function",
                            "function": { "name": c.name, "arguments": c.arguments },
                        })
                    })
                    .collect();
                msg["tool_calls"] = serde_json::json!(calls_json);
            }
            msg
        }
        Role::Tool => serde_json::json!({
            "role": "tool",
            "tool_call_id": m.tool_call_id.clone().unwrap_or_default(),
            "content": m.content,
        }),
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ApiToolCall>,
}

#[derive(Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

fn parse_response(api: ApiResponse) -> Result<ProviderResponse, ProviderError> {
    let choice = api
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Parse("response has no choices".into()))?;

    let tool_calls: Vec<ToolCall> = choice
        .message
        .tool_calls
        .into_iter()
        .map(|c| ToolCall {
            id: c.id,
            name: c.function.name,
            arguments: c.function.arguments,
        })
        .collect();

    let content = choice.message.content.unwrap_or_default();
    let finish_reason = map_finish(choice.finish_reason.as_deref(), !tool_calls.is_empty());

    let message = if tool_calls.is_empty() {
        Message::assistant(content)
    } else {
        Message::assistant_with_calls(content, tool_calls)
    };

    Ok(ProviderResponse {
        message,
        finish_reason,
        usage: api.usage.map(|u| Usage {
            tokens_in: u.prompt_tokens,
            tokens_out: u.completion_tokens,
        }),
    })
}

fn map_finish(reason: Option<&str>, has_tool_calls: bool) -> FinishReason {
    match reason {
        Some("tool_calls") => FinishReason::ToolCalls,
        Some("length") => FinishReason::Length,
        _ if has_tool_calls => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}

// --- streaming --------------------------------------------------------------

#[derive(Default)]
struct ToolCallBuilder {
    id: String,
    name: String,
    arguments: String,
}

async fn read_sse_stream(
    resp: reqwest::Response,
    tx: mpsc::Sender<StreamEvent>,
) -> Result<ProviderResponse, ProviderError> {
    let mut stream = resp.bytes_stream();
    let mut buffer = String::new();
    let mut content = String::new();
    let mut builders: Vec<ToolCallBuilder> = Vec::new();
    let mut finish: Option<String> = None;
    let mut usage: Option<Usage> = None;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(ProviderError::Http)?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].trim().to_string();
            buffer.drain(..=pos);
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                continue;
            }
            let Ok(parsed) = serde_json::from_str::<StreamChunk>(data) else {
                continue;
            };
            let Some(choice) = parsed.choices.into_iter().next() else {
                if let Some(u) = parsed.usage {
                    usage = Some(Usage {
                        tokens_in: u.prompt_tokens,
                        tokens_out: u.completion_tokens,
                    });
                }
                continue;
            };
            if let Some(reason) = choice.finish_reason {
                finish = Some(reason);
            }
            if let Some(delta_text) = choice.delta.content {
                if !delta_text.is_empty() {
                    content.push_str(&delta_text);
                    let _ = tx
                        .send(StreamEvent::Delta {
                            content: delta_text,
                        })
                        .await;
                }
            }
            for dc in choice.delta.tool_calls {
                let idx = dc.index;
                while builders.len() <= idx {
                    builders.push(ToolCallBuilder::default());
                }
                let b = &mut builders[idx];
                if let Some(id) = dc.id {
                    b.id = id;
                }
                if let Some(f) = dc.function {
                    if let Some(name) = f.name {
                        b.name.push_str(&name);
                    }
                    if let Some(args) = f.arguments {
                        b.arguments.push_str(&args);
                    }
                }
            }
            if let Some(u) = parsed.usage {
                usage = Some(Usage {
                    tokens_in: u.prompt_tokens,
                    tokens_out: u.completion_tokens,
                });
            }
        }
    }

    let tool_calls: Vec<ToolCall> = builders
        .into_iter()
        .filter(|b| !b.name.is_empty())
        .map(|b| ToolCall {
            id: b.id,
            name: b.name,
            arguments: if b.arguments.is_empty() {
                "{}".to_string()
            } else {
                b.arguments
            },
        })
        .collect();

    let finish_reason = map_finish(finish.as_deref(), !tool_calls.is_empty());
    let message = if tool_calls.is_empty() {
        Message::assistant(content)
    } else {
        Message::assistant_with_calls(content, tool_calls)
    };

    Ok(ProviderResponse {
        message,
        finish_reason,
        usage,
    })
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<StreamToolCallDelta>,
}

#[derive(Deserialize)]
struct StreamToolCallDelta {
    index: usize,
    id: Option<String>,
    function: Option<StreamFunctionDelta>,
}

#[derive(Deserialize)]
struct StreamFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}
