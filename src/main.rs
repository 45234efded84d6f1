use anyhow::Context;
use clap::Parser;
use frame_gateway::{build_router, identity::IdentityResolver, AppState, Config};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "frame-gateway", version, about = "Video frame routing gateway")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    }
    .with_env_overrides();
    config.validate()?;

    tracing::info!(
        port = config.server.http_port,
        buffer = config.gateway.buffer_size,
        video = config.services.video_processing.len(),
        analytics = config.services.analytics.len(),
        storage = config.services.storage.len(),
        "Starting frame gateway"
    );

    let identity = IdentityResolver::from_config(&config.identity);
    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout_secs);
    let bind_addr = format!("{}:{}", config.server.host, config.server.http_port);

    let state = AppState::start(config, identity);
    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;
    tracing::info!("Frame gateway listening on {}", bind_addr);

    let draining = state.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received, draining");
        // Subscriber streams end once their queues close.
        draining.cancel.cancel();
        draining.clients.close_all();
    })
    .await?;

    state.shutdown(shutdown_timeout).await;
    tracing::info!("Frame gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
