use std::net::SocketAddr;

use clap::Parser;
use tracing::{error, info};

mod app;
mod auth;
mod cli;
mod http;
mod ratelimit;
mod tls;
mod ws;

use cli::{Cli, Command};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "haya=info,haya_gateway=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli::config_path(cli.config.as_deref());

    let outcome: haya_core::Result<()> = match cli.command {
        Command::Init { provider_key_env } => cli::run_init(&config_path, &provider_key_env),
        Command::Start { port } => run_start(&config_path, port).await,
        Command::Channels { command } => match load_config(&config_path) {
            Ok(config) => cli::run_channels(&config, command).await,
            Err(e) => Err(e),
        },
        Command::Cron { command } => match load_config(&config_path) {
            Ok(config) => cli::run_cron(&config, &config_path, command).await,
            Err(e) => Err(e),
        },
        Command::Senders { command } => {
            load_config(&config_path).and_then(|config| cli::run_senders(&config, command))
        }
        Command::Config { command } => match command {
            cli::ConfigCommand::Show => {
                load_config(&config_path).and_then(|config| cli::run_config_show(&config))
            }
        },
        Command::Usage { session, since } => load_config(&config_path).and_then(|config| {
            cli::run_usage(&config, session.as_deref(), since.as_deref())
        }),
    };

    if let Err(e) = outcome {
        error!("{}: {}", e.code(), e);
        eprintln!("{}: {}", e.code(), e);
        std::process::exit(1);
    }
}

fn load_config(path: &str) -> haya_core::Result<haya_core::HayaConfig> {
    haya_core::HayaConfig::load(Some(path))
}

async fn run_start(config_path: &str, port_override: Option<u16>) -> haya_core::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    let state = app::AppState::build(config, config_path).await?;

    // channel plugins register through external adapter crates before
    // start_all; an empty dock just means no chat surfaces yet
    let channel_configs: std::collections::BTreeMap<String, serde_json::Value> = state
        .config
        .channels
        .iter()
        .map(|(id, entry)| {
            (
                id.clone(),
                serde_json::to_value(&entry.settings).unwrap_or(serde_json::json!({})),
            )
        })
        .collect();
    let report = state.dock.start_all(&channel_configs).await;
    for (id, err) in &report.failed {
        error!(channel = %id, error = %err, "channel failed to start");
    }

    state.scheduler.start();

    let addr: SocketAddr = state
        .config
        .bind_addr()
        .parse()
        .map_err(|e| haya_core::HayaError::Config(format!("bad bind address: {e}")))?;

    let tls_on = state.tls_enabled();
    info!(
        %addr,
        tls = tls_on,
        channels_started = report.started.len(),
        cron_jobs = state.scheduler.store().list().len(),
        "haya gateway listening"
    );

    let router = app::build_router(state.clone())
        .into_make_service_with_connect_info::<SocketAddr>();

    let serve_result: haya_core::Result<()> = if tls_on {
        let tls_cfg = state.config.gateway.tls.clone().expect("validated at load");
        let cert_path = std::path::PathBuf::from(tls_cfg.cert_path.expect("validated"));
        let key_path = std::path::PathBuf::from(tls_cfg.key_path.expect("validated"));
        let san = match state.config.gateway.bind {
            haya_core::config::BindMode::Custom => state
                .config
                .gateway
                .host
                .clone()
                .unwrap_or_else(|| "localhost".into()),
            _ => addr.ip().to_string(),
        };
        tls::ensure_tls_material(&cert_path, &key_path, &san)?;

        let rustls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .map_err(|e| haya_core::HayaError::Config(format!("TLS material unusable: {e}")))?;

        tokio::select! {
            r = axum_server::bind_rustls(addr, rustls).serve(router) => {
                r.map_err(|e| haya_core::HayaError::Internal(e.to_string()))
            }
            _ = shutdown_signal() => Ok(()),
        }
    } else {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| haya_core::HayaError::Internal(e.to_string()))
    };

    info!("shutting down");
    state.scheduler.stop();
    state.dock.stop_all().await;
    serve_result
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
