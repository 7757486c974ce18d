//! Command-line surface. Exit codes: 0 success, 1 error, 2 misuse
//! (clap reports usage errors with 2 on its own).

use clap::{Parser, Subcommand};
use rand::RngCore;
use serde_json::json;

use haya_core::config::GATEWAY_TOKEN_ENV;
use haya_core::{HayaConfig, HayaError, Result};
use haya_scheduler::CronStore;
use haya_senders::SenderStore;
use haya_sessions::UsageTracker;

#[derive(Parser)]
#[command(name = "haya", version, about = "Personal AI assistant gateway")]
pub struct Cli {
    /// Path to haya.json (default ~/.haya/haya.json).
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a fresh config with a generated auth token.
    Init {
        /// Env var name holding the provider API key.
        #[arg(long, default_value = "ANTHROPIC_API_KEY")]
        provider_key_env: String,
    },
    /// Run the gateway.
    Start {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Manage channel plugins on a running gateway.
    Channels {
        #[command(subcommand)]
        command: ChannelsCommand,
    },
    /// Manage scheduled jobs.
    Cron {
        #[command(subcommand)]
        command: CronCommand,
    },
    /// Manage sender pairing.
    Senders {
        #[command(subcommand)]
        command: SendersCommand,
    },
    /// Inspect configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Token/cost usage rollups.
    Usage {
        #[arg(long)]
        session: Option<String>,
        /// ISO-8601 lower bound.
        #[arg(long)]
        since: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum ChannelsCommand {
    List,
    Start { id: String },
    Stop { id: String },
}

#[derive(Subcommand)]
pub enum CronCommand {
    List,
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        schedule: String,
        #[arg(long)]
        action: String,
    },
    Remove { id: String },
}

#[derive(Subcommand)]
pub enum SendersCommand {
    /// Approve a pairing code.
    Approve { code: String },
    List,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the config with secrets masked.
    Show,
}

pub fn config_path(cli_path: Option<&str>) -> String {
    cli_path.map(String::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{home}/.haya/haya.json")
    })
}

// --- init -------------------------------------------------------------------

pub fn run_init(path: &str, provider_key_env: &str) -> Result<()> {
    if std::path::Path::new(path).exists() {
        return Err(HayaError::Config(format!("{path} already exists")));
    }
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let token = hex::encode(bytes);

    let config = json!({
        "gateway": {
            "port": haya_core::config::DEFAULT_PORT,
            "bind": "loopback",
            "auth": { "mode": "token", "token": token },
            "trusted_proxies": [],
        },
        "agent": {
            "default_provider": "anthropic",
            "default_model": "claude-sonnet-4-5",
            "default_provider_api_key_env_var": provider_key_env,
            "system_prompt": "You are Haya, a helpful personal assistant.",
        },
        "sessions": { "pruning": { "enabled": true, "max_age_days": 90 } },
        "cron": [
            { "name": "nightly-session-prune", "schedule": "20 4 * * *",
              "action": "prune_sessions" }
        ],
    });

    if let Some(parent) = std::path::Path::new(path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(&config)?)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    println!("Config written to {path}");
    println!("Gateway token (also honored via {GATEWAY_TOKEN_ENV}):");
    println!("{token}");
    Ok(())
}

// --- shim client ------------------------------------------------------------

/// Call the running gateway's HTTP shim.
async fn shim_call(
    config: &HayaConfig,
    method: &str,
    params: serde_json::Value,
) -> Result<serde_json::Value> {
    let token = config.resolve_gateway_token()?;
    let scheme = if config.gateway.tls.as_ref().is_some_and(|t| t.enabled) {
        "https"
    } else {
        "http"
    };
    let url = format!("{scheme}://127.0.0.1:{}/rpc", config.gateway.port);

    let client = reqwest::Client::builder()
        // the gateway's own self-signed material is expected here
        .danger_accept_invalid_certs(true)
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .map_err(|e| HayaError::Internal(e.to_string()))?;

    let body = json!({ "id": uuid::Uuid::new_v4().to_string(), "method": method, "params": params });
    let resp = client
        .post(&url)
        .bearer_auth(&token)
        .json(&body)
        .send()
        .await
        .map_err(|e| HayaError::Internal(format!("gateway not reachable at {url}: {e}")))?;

    let frame: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| HayaError::Internal(e.to_string()))?;
    if let Some(err) = frame.get("error") {
        let code = err.get("code").and_then(|v| v.as_str()).unwrap_or("INTERNAL");
        let message = err.get("message").and_then(|v| v.as_str()).unwrap_or("");
        return Err(HayaError::Internal(format!("{code}: {message}")));
    }
    Ok(frame.get("result").cloned().unwrap_or(serde_json::Value::Null))
}

// --- subcommands ------------------------------------------------------------

pub async fn run_channels(config: &HayaConfig, command: ChannelsCommand) -> Result<()> {
    match command {
        ChannelsCommand::List => {
            match shim_call(config, "channels.list", json!({})).await {
                Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                Err(_) => {
                    // gateway down: show what is configured
                    println!("gateway not running; configured channels:");
                    for id in config.channels.keys() {
                        println!("  {id}");
                    }
                }
            }
            Ok(())
        }
        ChannelsCommand::Start { id } => {
            shim_call(config, "channels.start", json!({ "id": id })).await?;
            println!("started {id}");
            Ok(())
        }
        ChannelsCommand::Stop { id } => {
            shim_call(config, "channels.stop", json!({ "id": id })).await?;
            println!("stopped {id}");
            Ok(())
        }
    }
}

pub async fn run_cron(config: &HayaConfig, config_path: &str, command: CronCommand) -> Result<()> {
    match command {
        CronCommand::List => {
            match shim_call(config, "cron.list", json!({})).await {
                Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                Err(_) => {
                    let store =
                        CronStore::load(format!("{config_path}.cron.json"), &config.cron)?;
                    println!("{}", serde_json::to_string_pretty(&store.list())?);
                }
            }
            Ok(())
        }
        CronCommand::Add {
            name,
            schedule,
            action,
        } => {
            let params = json!({ "name": name, "schedule": schedule, "action": action });
            match shim_call(config, "cron.add", params).await {
                Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                Err(_) => {
                    let store =
                        CronStore::load(format!("{config_path}.cron.json"), &config.cron)?;
                    let job = store.add(&name, &schedule, &action, Default::default())?;
                    println!("added {} ({})", job.name, job.id);
                }
            }
            Ok(())
        }
        CronCommand::Remove { id } => {
            match shim_call(config, "cron.remove", json!({ "id": id })).await {
                Ok(_) => println!("removed {id}"),
                Err(_) => {
                    let store =
                        CronStore::load(format!("{config_path}.cron.json"), &config.cron)?;
                    store.remove(&id)?;
                    println!("removed {id}");
                }
            }
            Ok(())
        }
    }
}

pub fn run_senders(config: &HayaConfig, command: SendersCommand) -> Result<()> {
    let Some(sa) = &config.sender_auth else {
        return Err(HayaError::Config("sender_auth is not configured".into()));
    };
    let store = SenderStore::new(sa.mode, &sa.data_dir)
        .map_err(|e| HayaError::Internal(e.to_string()))?;
    match command {
        SendersCommand::Approve { code } => {
            let approved = store
                .approve(&code)
                .map_err(|e| HayaError::NotFound(e.to_string()))?;
            println!("approved {} on {}", approved.sender_id, approved.channel);
            Ok(())
        }
        SendersCommand::List => {
            for s in store
                .list_approved()
                .map_err(|e| HayaError::Internal(e.to_string()))?
            {
                println!(
                    "{}\t{}\t{}",
                    s.channel,
                    s.sender_id,
                    s.sender_name.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
    }
}

pub fn run_config_show(config: &HayaConfig) -> Result<()> {
    let mut value = serde_json::to_value(config)?;
    if let Some(token) = value.pointer_mut("/gateway/auth/token") {
        if !token.is_null() {
            *token = json!("***");
        }
    }
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

pub fn run_usage(config: &HayaConfig, session: Option<&str>, since: Option<&str>) -> Result<()> {
    let since_ms = match since {
        Some(iso) => Some(
            chrono::DateTime::parse_from_rfc3339(iso)
                .map_err(|_| HayaError::Validation(format!("bad --since timestamp '{iso}'")))?
                .timestamp_millis(),
        ),
        None => None,
    };
    let tracker =
        UsageTracker::new(config.data_dir()).map_err(|e| HayaError::Internal(e.to_string()))?;
    let records = tracker
        .query(session, since_ms)
        .map_err(|e| HayaError::Internal(e.to_string()))?;

    let mut tokens_in = 0u64;
    let mut tokens_out = 0u64;
    for r in &records {
        tokens_in += r.tokens_in;
        tokens_out += r.tokens_out;
    }
    println!(
        "{} requests, {} tokens in, {} tokens out",
        records.len(),
        tokens_in,
        tokens_out
    );

    let by_model = tracker
        .totals_by_model()
        .map_err(|e| HayaError::Internal(e.to_string()))?;
    for (model, totals) in by_model {
        println!(
            "  {model}: {} req, {}/{} tokens",
            totals.requests, totals.tokens_in, totals.tokens_out
        );
    }
    Ok(())
}
