use std::net::IpAddr;
use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Json},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{HayaError, Result};

pub const DEFAULT_PORT: u16 = 18610;
/// Env var the gateway itself reserves for the auth token. Overrides
/// `gateway.auth.token` when set.
pub const GATEWAY_TOKEN_ENV: &str = "ASSISTANT_GATEWAY_TOKEN";
/// Hard cap per inbound WS text frame.
pub const MAX_PAYLOAD_BYTES: usize = 128 * 1024;
/// Heartbeat tick cadence on authenticated connections.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;
/// Minimum accepted auth token length.
pub const MIN_TOKEN_LEN: usize = 64;

/// Top-level config (haya.json + HAYA_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HayaConfig {
    pub gateway: GatewayConfig,
    pub agent: AgentConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub sender_auth: Option<SenderAuthConfig>,
    #[serde(default)]
    pub cron: Vec<CronJobSeed>,
    #[serde(default)]
    pub channels: std::collections::BTreeMap<String, ChannelEntry>,
    /// Root directory for sessions/, data/ and TLS material.
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub bind: BindMode,
    /// Required when bind = custom.
    pub host: Option<String>,
    pub auth: AuthConfig,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// IPv4/IPv6 addresses or CIDRs whose X-Forwarded-For we honor.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    #[default]
    Loopback,
    Lan,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub mode: AuthMode,
    /// Static token; `ASSISTANT_GATEWAY_TOKEN` takes precedence at use time.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Token,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub default_provider: ProviderKind,
    pub default_model: String,
    /// Name of the env var holding the provider API key. Required for every
    /// provider except bedrock (which uses the AWS credential chain).
    pub default_provider_api_key_env_var: Option<String>,
    /// Required for bedrock unless AWS_REGION / AWS_DEFAULT_REGION is set.
    pub aws_region: Option<String>,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default = "default_max_history")]
    pub max_history_messages: usize,
    /// Per-tool policy overrides: tool name -> allow|confirm|deny.
    #[serde(default)]
    pub tool_policies: std::collections::BTreeMap<String, ToolPolicyKind>,
    #[serde(default)]
    pub context_pruning: Option<ContextPruningConfig>,
    #[serde(default)]
    pub compaction: Option<CompactionConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Openai,
    #[default]
    Anthropic,
    Bedrock,
    Gemini,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Openai => write!(f, "openai"),
            ProviderKind::Anthropic => write!(f, "anthropic"),
            ProviderKind::Bedrock => write!(f, "bedrock"),
            ProviderKind::Gemini => write!(f, "gemini"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolPolicyKind {
    Allow,
    Confirm,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPruningConfig {
    #[serde(default = "default_soft_trim")]
    pub soft_trim_ratio: f64,
    #[serde(default = "default_hard_clear")]
    pub hard_clear_ratio: f64,
    #[serde(default = "default_min_prunable")]
    pub min_prunable_tool_chars: usize,
    #[serde(default = "default_keep_assistants")]
    pub keep_last_assistants: usize,
}

impl Default for ContextPruningConfig {
    fn default() -> Self {
        Self {
            soft_trim_ratio: default_soft_trim(),
            hard_clear_ratio: default_hard_clear(),
            min_prunable_tool_chars: default_min_prunable(),
            keep_last_assistants: default_keep_assistants(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    pub max_tokens: usize,
    #[serde(default = "default_reserve_tokens")]
    pub reserve_for_response: usize,
    #[serde(default = "default_recent_count")]
    pub recent_message_count: usize,
    /// When true the dropped prefix is summarized through the provider;
    /// otherwise it is dropped with a marker.
    #[serde(default)]
    pub summarize: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionsConfig {
    #[serde(default)]
    pub pruning: SessionPruningConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionPruningConfig {
    #[serde(default)]
    pub enabled: bool,
    pub max_age_days: Option<u64>,
    pub max_size_mb: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderAuthConfig {
    pub mode: SenderAuthMode,
    pub data_dir: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderAuthMode {
    Open,
    Allowlist,
    Pairing,
}

/// Read-only cron job seed merged into the persistent store at load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobSeed {
    pub name: String,
    /// Standard 5-field cron expression.
    pub schedule: String,
    pub action: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub metadata: std::collections::BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelEntry {
    #[serde(default)]
    pub settings: std::collections::BTreeMap<String, serde_json::Value>,
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_max_history() -> usize {
    100
}
fn default_soft_trim() -> f64 {
    0.3
}
fn default_hard_clear() -> f64 {
    0.5
}
fn default_min_prunable() -> usize {
    50_000
}
fn default_keep_assistants() -> usize {
    3
}
fn default_reserve_tokens() -> usize {
    1024
}
fn default_recent_count() -> usize {
    10
}
fn default_base_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.haya", home)
}

impl HayaConfig {
    /// Load config from a JSON file with HAYA_* env var overrides, then
    /// validate. The default path is `~/.haya/haya.json`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: HayaConfig = Figment::new()
            .merge(Json::file(&path))
            .merge(Env::prefixed("HAYA_").split("_"))
            .extract()
            .map_err(|e| HayaError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Schema-level checks that figment cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.bind != BindMode::Loopback {
            let tls_on = self.gateway.tls.as_ref().is_some_and(|t| t.enabled);
            if !tls_on {
                return Err(HayaError::Config(
                    "gateway.bind lan/custom requires tls.enabled = true".into(),
                ));
            }
        }
        if let Some(tls) = &self.gateway.tls {
            if tls.enabled && (tls.cert_path.is_none() || tls.key_path.is_none()) {
                return Err(HayaError::Config(
                    "tls.enabled requires cert_path and key_path".into(),
                ));
            }
        }
        if self.gateway.bind == BindMode::Custom && self.gateway.host.is_none() {
            return Err(HayaError::Config("gateway.bind custom requires host".into()));
        }
        if let Some(token) = &self.gateway.auth.token {
            if token.len() < MIN_TOKEN_LEN {
                return Err(HayaError::Config(format!(
                    "gateway.auth.token must be at least {MIN_TOKEN_LEN} characters"
                )));
            }
        }
        for entry in &self.gateway.trusted_proxies {
            parse_ip_or_cidr(entry).ok_or_else(|| {
                HayaError::Config(format!("trusted_proxies entry '{entry}' is not an IP or CIDR"))
            })?;
        }
        if self.agent.default_provider != ProviderKind::Bedrock
            && self.agent.default_provider_api_key_env_var.is_none()
        {
            return Err(HayaError::Config(
                "agent.default_provider_api_key_env_var is required for this provider".into(),
            ));
        }
        if self.agent.default_provider == ProviderKind::Bedrock
            && self.agent.aws_region.is_none()
            && std::env::var("AWS_REGION").is_err()
            && std::env::var("AWS_DEFAULT_REGION").is_err()
        {
            return Err(HayaError::Config(
                "bedrock requires agent.aws_region or AWS_REGION/AWS_DEFAULT_REGION".into(),
            ));
        }
        Ok(())
    }

    /// The auth token, with the reserved env var taking precedence.
    pub fn resolve_gateway_token(&self) -> Result<String> {
        if let Ok(t) = std::env::var(GATEWAY_TOKEN_ENV) {
            if !t.is_empty() {
                return Ok(t);
            }
        }
        self.gateway
            .auth
            .token
            .clone()
            .ok_or_else(|| HayaError::Config(format!("no auth token: set {GATEWAY_TOKEN_ENV}")))
    }

    /// The host:port the listener binds, derived from the bind mode.
    pub fn bind_addr(&self) -> String {
        let host = match self.gateway.bind {
            BindMode::Loopback => "127.0.0.1".to_string(),
            BindMode::Lan => "0.0.0.0".to_string(),
            BindMode::Custom => self
                .gateway
                .host
                .clone()
                .unwrap_or_else(|| "127.0.0.1".to_string()),
        };
        format!("{}:{}", host, self.gateway.port)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        PathBuf::from(&self.base_dir).join("sessions")
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.base_dir).join("data")
    }
}

/// Resolve a secret by env-var name at use time. Secrets never live in
/// config; only their env var names do.
pub fn resolve_env_secret(env_var: &str) -> Result<String> {
    std::env::var(env_var)
        .map_err(|_| HayaError::Config(format!("required environment variable {env_var} is not set")))
}

/// A trusted-proxy entry: single address or network prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNetwork {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl IpNetwork {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let bits = 32u32.saturating_sub(self.prefix as u32);
                let mask = if bits >= 32 { 0 } else { u32::MAX << bits };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let bits = 128u32.saturating_sub(self.prefix as u32);
                let mask = if bits >= 128 { 0 } else { u128::MAX << bits };
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

/// Parse `"10.0.0.0/8"` or a bare address (treated as a /32 or /128).
pub fn parse_ip_or_cidr(s: &str) -> Option<IpNetwork> {
    match s.split_once('/') {
        Some((addr, prefix)) => {
            let addr: IpAddr = addr.parse().ok()?;
            let prefix: u8 = prefix.parse().ok()?;
            let max = if addr.is_ipv4() { 32 } else { 128 };
            (prefix <= max).then_some(IpNetwork { addr, prefix })
        }
        None => {
            let addr: IpAddr = s.parse().ok()?;
            let prefix = if addr.is_ipv4() { 32 } else { 128 };
            Some(IpNetwork { addr, prefix })
        }
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.haya/haya.json", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> HayaConfig {
        HayaConfig {
            gateway: GatewayConfig {
                port: DEFAULT_PORT,
                bind: BindMode::Loopback,
                host: None,
                auth: AuthConfig {
                    mode: AuthMode::Token,
                    token: Some("a".repeat(64)),
                },
                tls: None,
                trusted_proxies: Vec::new(),
            },
            agent: AgentConfig {
                default_provider: ProviderKind::Anthropic,
                default_model: "claude-sonnet-4-5".into(),
                default_provider_api_key_env_var: Some("ANTHROPIC_API_KEY".into()),
                aws_region: None,
                system_prompt: String::new(),
                max_history_messages: 100,
                tool_policies: Default::default(),
                context_pruning: None,
                compaction: None,
            },
            sessions: SessionsConfig::default(),
            sender_auth: None,
            cron: Vec::new(),
            channels: Default::default(),
            base_dir: "/tmp/haya-test".into(),
        }
    }

    #[test]
    fn loopback_without_tls_is_valid() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn lan_bind_requires_tls() {
        let mut cfg = base_config();
        cfg.gateway.bind = BindMode::Lan;
        assert!(matches!(cfg.validate(), Err(HayaError::Config(_))));

        cfg.gateway.tls = Some(TlsConfig {
            enabled: true,
            cert_path: Some("/tmp/haya.crt".into()),
            key_path: Some("/tmp/haya.key".into()),
        });
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn tls_enabled_requires_paths() {
        let mut cfg = base_config();
        cfg.gateway.tls = Some(TlsConfig {
            enabled: true,
            cert_path: None,
            key_path: None,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn short_token_rejected() {
        let mut cfg = base_config();
        cfg.gateway.auth.token = Some("short".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_proxy_entry_rejected() {
        let mut cfg = base_config();
        cfg.gateway.trusted_proxies = vec!["not-an-ip".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn cidr_matching() {
        let net = parse_ip_or_cidr("10.0.0.0/8").unwrap();
        assert!(net.contains("10.200.3.4".parse().unwrap()));
        assert!(!net.contains("11.0.0.1".parse().unwrap()));

        let single = parse_ip_or_cidr("192.168.1.5").unwrap();
        assert!(single.contains("192.168.1.5".parse().unwrap()));
        assert!(!single.contains("192.168.1.6".parse().unwrap()));
    }

    #[test]
    fn bedrock_does_not_need_api_key_env() {
        let mut cfg = base_config();
        cfg.agent.default_provider = ProviderKind::Bedrock;
        cfg.agent.default_provider_api_key_env_var = None;
        cfg.agent.aws_region = Some("us-east-1".into());
        assert!(cfg.validate().is_ok());
    }
}
