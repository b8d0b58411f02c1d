//! exgate server binary.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use exgate_core::AppConfig;
use exgate_server::ratelimit::spawn_cleanup_task;
use exgate_server::{GatewayService, create_router};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// exgate - export artifact gateway
#[derive(Parser, Debug)]
#[command(name = "exgated")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "EXGATE_CONFIG",
        default_value = "config/gateway.toml"
    )]
    config: String,

    /// Log output format
    #[arg(long, env = "EXGATE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    tracing::info!("exgate v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;
    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;

    let service = Arc::new(GatewayService::new(config).context("failed to start gateway")?);

    let rate_limiter = service.rate_limiter().clone();
    if rate_limiter.is_enabled() {
        let interval = Duration::from_secs(service.config().rate_limit.cleanup_interval_secs);
        spawn_cleanup_task(rate_limiter, interval);
        tracing::info!(
            cleanup_interval_secs = interval.as_secs(),
            "Rate limiter cleanup task started"
        );
    }

    let app = create_router(service.clone());

    tracing::info!("Listening on {}", addr);

    // ConnectInfo supplies the client address used for anonymous rate limiting.
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Flushing audit trail");
    service.audit().flush().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

/// Load configuration (file is optional, env vars can provide/override everything).
fn load_config(config_path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    let has_config_file = Path::new(config_path).exists();

    if has_config_file {
        tracing::info!(config_path, "Loading configuration from file");
        figment = figment.merge(Toml::file(config_path));
    } else {
        tracing::debug!("No config file found at {}", config_path);
    }

    // EXGATE_CONFIG and EXGATE_LOG_FORMAT only select how to start.
    let has_env_config = std::env::vars().any(|(key, _)| {
        key.starts_with("EXGATE_") && key != "EXGATE_CONFIG" && key != "EXGATE_LOG_FORMAT"
    });

    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: exgated --config /path/to/gateway.toml\n  \
             2. Environment variables: EXGATE_EXPORTS__ROOT=/srv/exports \
             EXGATE_AUTH__API_KEY=YOUR_KEY_HERE exgated\n\n\
             See config/gateway.example.toml for example configuration.\n\
             Set EXGATE_CONFIG env var to specify a default config file path."
        );
    }

    if !has_config_file {
        tracing::info!("Using environment variables for configuration");
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("EXGATE_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    Ok(config)
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
