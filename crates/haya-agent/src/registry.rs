//! Provider construction by config name.
//!
//! Only the configured backend is built; secrets are resolved from env vars
//! at construction time, never stored in config.

use std::sync::Arc;

use haya_core::config::{resolve_env_secret, AgentConfig, ProviderKind};
use haya_core::{HayaError, Result};

use crate::anthropic::AnthropicProvider;
use crate::bedrock::BedrockProvider;
use crate::gemini::GeminiProvider;
use crate::openai::OpenAiProvider;
use crate::provider::Provider;

pub fn build_provider(agent: &AgentConfig) -> Result<Arc<dyn Provider>> {
    match agent.default_provider {
        ProviderKind::Openai => {
            let key = resolve_api_key(agent)?;
            Ok(Arc::new(OpenAiProvider::new(key, None)))
        }
        ProviderKind::Anthropic => {
            let key = resolve_api_key(agent)?;
            Ok(Arc::new(AnthropicProvider::new(key, None)))
        }
        ProviderKind::Gemini => {
            let key = resolve_api_key(agent)?;
            Ok(Arc::new(GeminiProvider::new(key, None)))
        }
        ProviderKind::Bedrock => {
            let region = agent
                .aws_region
                .clone()
                .or_else(|| std::env::var("AWS_REGION").ok())
                .or_else(|| std::env::var("AWS_DEFAULT_REGION").ok())
                .ok_or_else(|| {
                    HayaError::Config("bedrock requires aws_region or AWS_REGION".into())
                })?;
            let provider = BedrockProvider::from_env(region, None)
                .map_err(|e| HayaError::Config(e.to_string()))?;
            Ok(Arc::new(provider))
        }
    }
}

fn resolve_api_key(agent: &AgentConfig) -> Result<String> {
    let env_var = agent
        .default_provider_api_key_env_var
        .as_deref()
        .ok_or_else(|| {
            HayaError::Config(format!(
                "provider {} requires default_provider_api_key_env_var",
                agent.default_provider
            ))
        })?;
    resolve_env_secret(env_var)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn agent(kind: ProviderKind, env_var: Option<&str>) -> AgentConfig {
        AgentConfig {
            default_provider: kind,
            default_model: "m".into(),
            default_provider_api_key_env_var: env_var.map(String::from),
            aws_region: None,
            system_prompt: String::new(),
            max_history_messages: 100,
            tool_policies: BTreeMap::new(),
            context_pruning: None,
            compaction: None,
        }
    }

    #[test]
    fn missing_env_var_is_a_config_error() {
        let cfg = agent(ProviderKind::Anthropic, Some("HAYA_TEST_KEY_THAT_IS_UNSET"));
        assert!(matches!(
            build_provider(&cfg),
            Err(HayaError::Config(_))
        ));
    }

    #[test]
    fn named_env_var_is_read_at_build_time() {
        std::env::set_var("HAYA_TEST_ANTHROPIC_KEY", "sk-test");
        let cfg = agent(ProviderKind::Anthropic, Some("HAYA_TEST_ANTHROPIC_KEY"));
        let provider = build_provider(&cfg).unwrap();
        assert_eq!(provider.name(), "anthropic");
        std::env::remove_var("HAYA_TEST_ANTHROPIC_KEY");
    }
}
