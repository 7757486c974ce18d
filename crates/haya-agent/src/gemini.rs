//! Google Gemini driver (Generative Language API, generateContent).
//!
//! Gemini does not assign ids to function calls, so ids are synthesized as
//! `call-<index>-<name>` when translating responses and resolved back to
//! function names when re-sending tool results.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use haya_core::{Message, Role, ToolCall};

use crate::provider::{
    FinishReason, Provider, ProviderError, ProviderRequest, ProviderResponse, Usage,
};
use crate::retry::parse_retry_after;

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            api_key,
            base_url: base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string()),
        }
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn complete(&self, req: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let body = build_request_body(req);
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, req.model
        );

        debug!(model = %req.model, "sending request to Gemini");

        let resp = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after_ms = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Gemini API error");
            return Err(ProviderError::Api {
                status,
                message: text,
                retry_after_ms,
            });
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        parse_response(api_resp)
    }
}

fn build_request_body(req: &ProviderRequest) -> serde_json::Value {
    let system: String = req
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    // Map synthesized call ids back to function names for tool results.
    let mut call_names: std::collections::HashMap<String, String> = std::collections::HashMap::new();
    for m in &req.messages {
        for call in m.tool_calls.as_deref().unwrap_or(&[]) {
            call_names.insert(call.id.clone(), call.name.clone());
        }
    }

    let mut contents: Vec<serde_json::Value> = Vec::new();
    for m in &req.messages {
        match m.role {
            Role::System => {}
            Role::User => contents.push(serde_json::json!({
                "role": "user",
                "parts": [{ "text": m.content }],
            })),
            Role::Assistant => {
                let mut parts: Vec<serde_json::Value> = Vec::new();
                if !m.content.is_empty() {
                    parts.push(serde_json::json!({ "text": m.content }));
                }
                for call in m.tool_calls.as_deref().unwrap_or(&[]) {
                    let args: serde_json::Value =
                        serde_json::from_str(&call.arguments).unwrap_or(serde_json::json!({}));
                    parts.push(serde_json::json!({
                        "functionCall": { "name": call.name, "args": args },
                    }));
                }
                contents.push(serde_json::json!({ "role": "model", "parts": parts }));
            }
            Role::Tool => {
                let name = m
                    .tool_call_id
                    .as_ref()
                    .and_then(|id| call_names.get(id))
                    .cloned()
                    .unwrap_or_default();
                contents.push(serde_json::json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            "name": name,
                            "response": { "content": m.content },
                        }
                    }],
                }));
            }
        }
    }

    let mut body = serde_json::json!({
        "contents": contents,
        "generationConfig": { "maxOutputTokens": req.max_tokens },
    });
    if !system.is_empty() {
        body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": system }] });
    }
    if !req.tools.is_empty() {
        let declarations: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();
        body["tools"] = serde_json::json!([{ "functionDeclarations": declarations }]);
    }
    body
}

#[derive(Deserialize)]
struct ApiResponse {
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
    #[serde(rename = "functionCall")]
    function_call: Option<FunctionCall>,
}

#[derive(Deserialize)]
struct FunctionCall {
    name: String,
    args: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u64,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u64,
}

fn parse_response(api: ApiResponse) -> Result<ProviderResponse, ProviderError> {
    let candidate = api
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Parse("response has no candidates".into()))?;

    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(t) = part.text {
            text.push_str(&t);
        }
        if let Some(fc) = part.function_call {
            let args = fc.args.unwrap_or(serde_json::json!({}));
            let id = format!("call-{}-{}", tool_calls.len(), fc.name);
            tool_calls.push(ToolCall {
                id,
                name: fc.name,
                arguments: serde_json::to_string(&args).unwrap_or_else(|_| "{}".into()),
            });
        }
    }

    let finish_reason = if !tool_calls.is_empty() {
        FinishReason::ToolCalls
    } else {
        match candidate.finish_reason.as_deref() {
            Some("MAX_TOKENS") => FinishReason::Length,
            _ => FinishReason::Stop,
        }
    };

    let message = if tool_calls.is_empty() {
        Message::assistant(text)
    } else {
        Message::assistant_with_calls(text, tool_calls)
    };

    Ok(ProviderResponse {
        message,
        finish_reason,
        usage: api.usage_metadata.map(|u| Usage {
            tokens_in: u.prompt_token_count,
            tokens_out: u.candidates_token_count,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_results_resolve_back_to_function_names() {
        let req = ProviderRequest {
            model: "gemini-test".into(),
            messages: vec![
                Message::user("weather?"),
                Message::assistant_with_calls(
                    "",
                    vec![ToolCall {
                        id: "call-0-weather".into(),
                        name: "weather".into(),
                        arguments: r#"{"city":"Oslo"}"#.into(),
                    }],
                ),
                Message::tool_result("call-0-weather", "4C, rain"),
            ],
            tools: Vec::new(),
            max_tokens: 64,
        };
        let body = build_request_body(&req);
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents[1]["parts"][0]["functionCall"]["name"], "weather");
        assert_eq!(
            contents[2]["parts"][0]["functionResponse"]["name"],
            "weather"
        );
    }

    #[test]
    fn parses_function_call_with_synthesized_id() {
        let raw = serde_json::json!({
            "candidates": [{
                "content": { "parts": [
                    { "functionCall": { "name": "echo", "args": { "input": "hi" } } }
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": { "promptTokenCount": 5, "candidatesTokenCount": 2 }
        });
        let api: ApiResponse = serde_json::from_value(raw).unwrap();
        let resp = parse_response(api).unwrap();
        assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
        let calls = resp.message.tool_calls.unwrap();
        assert_eq!(calls[0].id, "call-0-echo");
    }

    #[test]
    fn max_tokens_maps_to_length() {
        let raw = serde_json::json!({
            "candidates": [{
                "content": { "parts": [{ "text": "truncat" }] },
                "finishReason": "MAX_TOKENS"
            }]
        });
        let api: ApiResponse = serde_json::from_value(raw).unwrap();
        let resp = parse_response(api).unwrap();
        assert_eq!(resp.finish_reason, FinishReason::Length);
        assert!(resp.usage.is_none());
    }
}
