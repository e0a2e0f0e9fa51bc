use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use viya_relay::api::{self, ApiState};
use viya_relay::config::RelayConfig;
use viya_relay::logging;
use viya_relay::router::FallbackRouter;
use viya_relay::whatsapp::{
    EvolutionOptions, EvolutionTransport, FileCredentialStore, Session, WhatsAppAgent,
    command_channel, event_channel,
};

#[derive(Debug, Parser)]
#[command(name = "viya-relay", version, about)]
struct Cli {
    /// Config file (default: ~/.viya-relay/config.toml)
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Override the HTTP listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the log level (e.g. debug, info)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut cfg = RelayConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(port) = cli.port {
        cfg.server.port = port;
    }
    if let Some(level) = cli.log_level {
        cfg.logging.level = level;
    }
    let _log_guard = logging::init(&cfg.logging)?;
    for warning in cfg.warnings() {
        tracing::warn!("Config: {}", warning);
    }

    tracing::info!(
        "Starting viya-relay v{} (instance '{}', {} processor(s))",
        env!("CARGO_PKG_VERSION"),
        cfg.whatsapp.instance_name,
        cfg.processors.len()
    );

    let (events_tx, events_rx) = event_channel();
    let (commands_tx, commands_rx) = command_channel();

    let transport = Arc::new(EvolutionTransport::new(
        EvolutionOptions {
            api_url: cfg.whatsapp.api_url.clone(),
            api_key: cfg.whatsapp.api_key.clone(),
            instance_name: cfg.whatsapp.instance_name.clone(),
            webhook_url: cfg.whatsapp.webhook_url.clone(),
            request_timeout: Duration::from_secs(
                cfg.whatsapp
                    .connect_timeout_secs
                    .max(cfg.whatsapp.send_timeout_secs),
            ),
        },
        events_tx.clone(),
    )
    .context("failed to build the Evolution API client")?);
    let store = Arc::new(FileCredentialStore::in_dir(&cfg.whatsapp.data_dir));
    tracing::info!("Credentials stored at {}", store.path().display());

    let session = Arc::new(Session::new(transport, store, cfg.whatsapp.limits()));
    let router = Arc::new(FallbackRouter::new(
        cfg.processors.clone(),
        cfg.fallback.apology.clone(),
    ));

    let agent = WhatsAppAgent::new(
        session.clone(),
        router.clone(),
        cfg.reconnect.policy(),
        events_rx,
        commands_rx,
        cfg.whatsapp.data_dir.clone(),
    )
    .start();

    let app = api::router(ApiState {
        session,
        endpoints: Arc::new(router.endpoints().to_vec()),
        events: events_tx,
        commands: commands_tx,
        instance_name: cfg.whatsapp.instance_name.clone(),
        default_country_code: cfg.whatsapp.default_country_code.clone(),
        api_key: cfg.control.api_key.clone(),
        webhook_keys: Arc::new(cfg.whatsapp.webhook_keys()),
    });

    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("Control API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    agent.abort();
    tracing::info!("viya-relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
