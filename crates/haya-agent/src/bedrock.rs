//! AWS Bedrock driver with SigV4 authentication.
//!
//! Auth flow:
//!   1. Credentials come from the standard chain: AWS_ACCESS_KEY_ID /
//!      AWS_SECRET_ACCESS_KEY / AWS_SESSION_TOKEN env vars, then the
//!      ~/.aws/credentials file (profile support).
//!   2. Each request is signed with SigV4 (HMAC-SHA256).
//!   3. Requests go to the Bedrock Runtime InvokeModel endpoint.
//!
//! The request body follows the Anthropic Messages API (for Claude models
//! on Bedrock), so translation shares the Anthropic adapter's logic.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use haya_core::{Message, ToolCall};

use crate::provider::{
    FinishReason, Provider, ProviderError, ProviderRequest, ProviderResponse, Usage,
};

type HmacSha256 = Hmac<Sha256>;

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

/// AWS credentials resolved from the standard chain.
#[derive(Debug, Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

pub struct BedrockProvider {
    client: reqwest::Client,
    credentials: AwsCredentials,
    region: String,
}

impl BedrockProvider {
    pub fn new(credentials: AwsCredentials, region: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            credentials,
            region,
        }
    }

    /// Load credentials from the standard AWS chain.
    pub fn from_env(region: String, profile: Option<&str>) -> Result<Self, ProviderError> {
        let creds = resolve_aws_credentials(profile)?;
        Ok(Self::new(creds, region))
    }

    fn endpoint(&self, model_id: &str) -> String {
        format!(
            "https://bedrock-runtime.{}.amazonaws.com/model/{}/invoke",
            self.region, model_id
        )
    }

    fn build_body(&self, req: &ProviderRequest) -> serde_json::Value {
        // Anthropic Messages shape with the Bedrock version marker and no
        // model field (the model id lives in the URL).
        let mut body = crate::anthropic::build_request_body(req);
        if let Some(obj) = body.as_object_mut() {
            obj.remove("model");
            obj.insert(
                "anthropic_version".to_string(),
                serde_json::json!("bedrock-2023-05-31"),
            );
        }
        body
    }

    async fn signed_request(
        &self,
        url: &str,
        body: &[u8],
    ) -> Result<reqwest::Response, ProviderError> {
        let now = chrono::Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let parsed = reqwest::Url::parse(url)
            .map_err(|e| ProviderError::Parse(format!("bad Bedrock URL: {e}")))?;
        let host = parsed.host_str().unwrap_or("");
        let path = parsed.path();

        let payload_hash = hex::encode(Sha256::digest(body));
        let mut signed_headers = "content-type;host;x-amz-date".to_string();
        let mut canonical_headers =
            format!("content-type:application/json\nhost:{host}\nx-amz-date:{amz_date}\n");

        if let Some(ref token) = self.credentials.session_token {
            canonical_headers = format!(
                "content-type:application/json\nhost:{host}\nx-amz-date:{amz_date}\nx-amz-security-token:{token}\n"
            );
            signed_headers = "content-type;host;x-amz-date;x-amz-security-token".to_string();
        }

        let canonical_request =
            format!("POST\n{path}\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}");

        let credential_scope = format!("{date_stamp}/{}/bedrock/aws4_request", self.region);
        let canonical_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
        let string_to_sign =
            format!("AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{canonical_hash}");

        let signing_key = derive_signing_key(
            &self.credentials.secret_access_key,
            &date_stamp,
            &self.region,
            "bedrock",
        );

        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.credentials.access_key_id, credential_scope, signed_headers, signature
        );

        let mut builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("x-amz-date", &amz_date)
            .header("Authorization", &authorization);

        if let Some(ref token) = self.credentials.session_token {
            builder = builder.header("x-amz-security-token", token);
        }

        let resp = builder.body(body.to_vec()).send().await?;
        Ok(resp)
    }
}

#[async_trait]
impl Provider for BedrockProvider {
    fn name(&self) -> &str {
        "bedrock"
    }

    async fn complete(&self, req: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let url = self.endpoint(&req.model);
        let body = self.build_body(req);
        let body_bytes =
            serde_json::to_vec(&body).map_err(|e| ProviderError::Parse(e.to_string()))?;

        debug!(model = %req.model, region = %self.region, "sending request to AWS Bedrock");

        let resp = self.signed_request(&url, &body_bytes).await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Bedrock API error");
            return Err(ProviderError::Api {
                status,
                message: text,
                retry_after_ms: None,
            });
        }

        let api_resp: BedrockResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(parse_response(api_resp))
    }
}

#[derive(Deserialize)]
struct BedrockResponse {
    content: Vec<BedrockBlock>,
    stop_reason: Option<String>,
    usage: BedrockUsage,
}

#[derive(Deserialize)]
struct BedrockBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
    id: Option<String>,
    name: Option<String>,
    input: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct BedrockUsage {
    input_tokens: u64,
    output_tokens: u64,
}

fn parse_response(api: BedrockResponse) -> ProviderResponse {
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

    let finish_reason = match api.stop_reason.as_deref() {
        Some("tool_use") => FinishReason::ToolCalls,
        Some("max_tokens") => FinishReason::Length,
        _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    };
    let message = if tool_calls.is_empty() {
        Message::assistant(text)
    } else {
        Message::assistant_with_calls(text, tool_calls)
    };

    ProviderResponse {
        message,
        finish_reason,
        usage: Some(Usage {
            tokens_in: api.usage.input_tokens,
            tokens_out: api.usage.output_tokens,
        }),
    }
}

// ── SigV4 helpers ────────────────────────────────────────────────────────────

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn derive_signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

// ── AWS credential resolution ────────────────────────────────────────────────

fn resolve_aws_credentials(profile: Option<&str>) -> Result<AwsCredentials, ProviderError> {
    if let (Ok(key_id), Ok(secret)) = (
        std::env::var("AWS_ACCESS_KEY_ID"),
        std::env::var("AWS_SECRET_ACCESS_KEY"),
    ) {
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();
        return Ok(AwsCredentials {
            access_key_id: key_id,
            secret_access_key: secret,
            session_token,
        });
    }

    let home = std::env::var("HOME")
        .map_err(|_| ProviderError::Parse("no AWS credentials: HOME not set".into()))?;
    let path = format!("{home}/.aws/credentials");
    let raw = std::fs::read_to_string(&path)
        .map_err(|_| ProviderError::Parse(format!("no AWS credentials in env or {path}")))?;
    parse_credentials_file(&raw, profile.unwrap_or("default"))
}

fn parse_credentials_file(raw: &str, profile: &str) -> Result<AwsCredentials, ProviderError> {
    let mut in_profile = false;
    let mut key_id = None;
    let mut secret = None;
    let mut token = None;

    for line in raw.lines() {
        let line = line.trim();
        if line.starts_with('[') && line.ends_with(']') {
            in_profile = &line[1..line.len() - 1] == profile;
            continue;
        }
        if !in_profile {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            match k.trim() {
                "aws_access_key_id" => key_id = Some(v.trim().to_string()),
                "aws_secret_access_key" => secret = Some(v.trim().to_string()),
                "aws_session_token" => token = Some(v.trim().to_string()),
                _ => {}
            }
        }
    }

    match (key_id, secret) {
        (Some(access_key_id), Some(secret_access_key)) => Ok(AwsCredentials {
            access_key_id,
            secret_access_key,
            session_token: token,
        }),
        _ => Err(ProviderError::Parse(format!(
            "profile '{profile}' missing aws_access_key_id/aws_secret_access_key"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_key_is_deterministic() {
        let a = derive_signing_key("secret", "20260801", "us-east-1", "bedrock");
        let b = derive_signing_key("secret", "20260801", "us-east-1", "bedrock");
        assert_eq!(a, b);
        let c = derive_signing_key("secret", "20260802", "us-east-1", "bedrock");
        assert_ne!(a, c);
    }

    #[test]
    fn credentials_file_parsing_honors_profile() {
        let raw = "\
[default]
aws_access_key_id = AKIADEFAULT
aws_secret_access_key = s1

[work]
aws_access_key_id = AKIAWORK
aws_secret_access_key = s2
aws_session_token = tok
";
        let default = parse_credentials_file(raw, "default").unwrap();
        assert_eq!(default.access_key_id, "AKIADEFAULT");
        assert!(default.session_token.is_none());

        let work = parse_credentials_file(raw, "work").unwrap();
        assert_eq!(work.access_key_id, "AKIAWORK");
        assert_eq!(work.session_token.as_deref(), Some("tok"));

        assert!(parse_credentials_file(raw, "absent").is_err());
    }

    #[test]
    fn body_carries_bedrock_version_and_no_model() {
        let provider = BedrockProvider::new(
            AwsCredentials {
                access_key_id: "k".into(),
                secret_access_key: "s".into(),
                session_token: None,
            },
            "us-east-1".into(),
        );
        let req = ProviderRequest {
            model: "anthropic.claude-test".into(),
            messages: vec![Message::user("hi")],
            tools: Vec::new(),
            max_tokens: 64,
        };
        let body = provider.build_body(&req);
        assert_eq!(body["anthropic_version"], "bedrock-2023-05-31");
        assert!(body.get("model").is_none());
    }

    #[test]
    fn parses_tool_use_blocks() {
        let raw = serde_json::json!({
            "content": [
                { "type": "tool_use", "id": "t1", "name": "echo", "input": {"x": 1} }
            ],
            "stop_reason": "tool_use",
            "usage": { "input_tokens": 1, "output_tokens": 2 }
        });
        let api: BedrockResponse = serde_json::from_value(raw).unwrap();
        let resp = parse_response(api);
        assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
        assert_eq!(resp.message.tool_calls.unwrap()[0].name, "echo");
    }
}
