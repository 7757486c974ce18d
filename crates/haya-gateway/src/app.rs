//! Central shared state and router assembly.

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use haya_agent::pipeline::{HistoryManager, MessageProcessor};
use haya_agent::tools::{PolicyEngine, ToolRegistry};
use haya_agent::{AgentRuntime, CircuitBreaker};
use haya_channels::{ChannelDock, OutboundMessage};
use haya_core::config::IpNetwork;
use haya_core::{HayaConfig, HayaError, Result};
use haya_scheduler::{
    CronStore, SchedulerService, ACTION_PRUNE_SESSIONS, ACTION_SEND_REMINDER,
};
use haya_senders::SenderStore;
use haya_sessions::{PruneOptions, SessionStore, UsageTracker};

use crate::auth::parse_trusted_proxies;
use crate::ratelimit::AuthRateLimiter;

pub struct AppState {
    pub config: HayaConfig,
    /// Resolved auth token (env override applied at boot).
    pub token: String,
    pub store: Arc<SessionStore>,
    pub history: Arc<HistoryManager>,
    pub usage: Arc<UsageTracker>,
    pub senders: Option<Arc<SenderStore>>,
    pub dock: Arc<ChannelDock>,
    pub runtime: Arc<AgentRuntime>,
    pub processor: Arc<MessageProcessor>,
    pub scheduler: Arc<SchedulerService>,
    pub limiter: Arc<AuthRateLimiter>,
    pub trusted_proxies: Vec<IpNetwork>,
    /// Active WS connections: conn_id -> outbound frame sender.
    pub ws_clients: DashMap<String, mpsc::Sender<String>>,
    /// In-flight chat streams: "<conn_id>/<request_id>" -> abort token.
    pub active_streams: DashMap<String, CancellationToken>,
}

impl AppState {
    /// Wire every subsystem from config. `config_path` anchors the cron
    /// store file (`<config>.cron.json`).
    pub async fn build(config: HayaConfig, config_path: &str) -> Result<Arc<Self>> {
        let token = config.resolve_gateway_token()?;

        let store = Arc::new(SessionStore::new(config.sessions_dir())?);
        let history = Arc::new(HistoryManager::new(
            store.clone(),
            config.agent.max_history_messages,
        ));
        let usage = Arc::new(UsageTracker::new(config.data_dir())?);

        let senders = match &config.sender_auth {
            Some(sa) => Some(Arc::new(
                SenderStore::new(sa.mode, &sa.data_dir)
                    .map_err(|e| HayaError::Config(e.to_string()))?,
            )),
            None => None,
        };

        let provider = haya_agent::registry::build_provider(&config.agent)?;
        let tools = Arc::new(ToolRegistry::new(PolicyEngine::new(
            config.agent.tool_policies.clone(),
            None,
        )));
        let breaker = Arc::new(CircuitBreaker::default());
        let runtime = Arc::new(AgentRuntime::new(
            provider,
            tools,
            breaker,
            Some(config.agent.system_prompt.clone()),
            config.agent.default_model.clone(),
        ));

        let dock = Arc::new(ChannelDock::new());

        let processor = Arc::new(MessageProcessor::new(
            runtime.clone(),
            history.clone(),
            usage.clone(),
            senders.clone(),
            dock.clone(),
            vec!["haya".to_string()],
            config.agent.compaction.clone(),
            config.agent.context_pruning.clone(),
            &config.agent.system_prompt,
        ));

        // every channel funnels into the one processor
        {
            let processor = processor.clone();
            dock.on_message(move |msg| {
                let processor = processor.clone();
                async move {
                    if let Err(e) = processor.process(msg).await {
                        error!(error = %e, "message pipeline failed");
                    }
                }
            });
        }
        dock.run_inbound_loop().await;

        let cron_store = Arc::new(CronStore::load(
            format!("{config_path}.cron.json"),
            &config.cron,
        )?);
        let scheduler = SchedulerService::new(cron_store);
        wire_scheduler_actions(&scheduler, &store, &dock, &config);

        let limiter = Arc::new(AuthRateLimiter::default());
        limiter.spawn_prune_task();

        let trusted_proxies = parse_trusted_proxies(&config.gateway.trusted_proxies);

        Ok(Arc::new(Self {
            config,
            token,
            store,
            history,
            usage,
            senders,
            dock,
            runtime,
            processor,
            scheduler,
            limiter,
            trusted_proxies,
            ws_clients: DashMap::new(),
            active_streams: DashMap::new(),
        }))
    }

    pub fn tls_enabled(&self) -> bool {
        self.config
            .gateway
            .tls
            .as_ref()
            .is_some_and(|t| t.enabled)
    }
}

fn wire_scheduler_actions(
    scheduler: &Arc<SchedulerService>,
    store: &Arc<SessionStore>,
    dock: &Arc<ChannelDock>,
    config: &HayaConfig,
) {
    let store = store.clone();
    let dock = dock.clone();
    let pruning = config.sessions.pruning.clone();
    scheduler.on_action(move |job| {
        let store = store.clone();
        let dock = dock.clone();
        let pruning = pruning.clone();
        async move {
            match job.action.as_str() {
                ACTION_PRUNE_SESSIONS => {
                    if !pruning.enabled {
                        return;
                    }
                    match store.prune(PruneOptions {
                        max_age_days: pruning.max_age_days,
                        max_size_mb: pruning.max_size_mb,
                    }) {
                        Ok(stats) => info!(
                            deleted = stats.deleted_count,
                            freed_bytes = stats.freed_bytes,
                            "scheduled session prune complete"
                        ),
                        Err(e) => error!(error = %e, "scheduled session prune failed"),
                    }
                }
                ACTION_SEND_REMINDER => {
                    let text = job
                        .metadata
                        .get("message")
                        .and_then(|v| v.as_str())
                        .unwrap_or("Reminder");
                    let channel = job.metadata.get("channel").and_then(|v| v.as_str());
                    let channel_id = job.metadata.get("channel_id").and_then(|v| v.as_str());
                    let (Some(channel), Some(channel_id)) = (channel, channel_id) else {
                        warn!(job = %job.name, "reminder without delivery target");
                        return;
                    };
                    let out = OutboundMessage::text(format!("Reminder: {text}"));
                    if let Err(e) = dock.send(channel, channel_id, &out).await {
                        warn!(job = %job.name, error = %e, "reminder delivery failed");
                    }
                }
                other => warn!(action = other, "unknown cron action"),
            }
        }
    });
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(crate::ws::connection::root_handler))
        .route("/health", get(crate::http::health::health_handler))
        .route("/chat", get(crate::http::ui::chat_ui_handler))
        .route("/rpc", post(crate::http::rpc::rpc_shim_handler))
        .layer(middleware::from_fn(crate::http::headers::security_headers))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
