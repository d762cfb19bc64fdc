use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use estate_rag::{
    api::{create_app, AppState},
    Config, EstateRag,
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "estate_rag=info,estate_rag_server=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting estate-rag server");

    let config = match std::env::var("ESTATE_RAG_CONFIG") {
        Ok(path) => {
            info!("Loading configuration from: {}", path);
            Config::from_file(&path.clone().into())
                .with_context(|| format!("failed to load configuration from {}", path))?
        }
        Err(_) => {
            warn!("No ESTATE_RAG_CONFIG set, using environment and defaults");
            Config::default()
        }
    };
    config.validate().context("invalid configuration")?;

    if !config.auth.enabled {
        warn!("Authentication is disabled; every request runs as the admin dev identity");
    }

    let bind_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.server.host, config.server.port))?;

    info!("Initializing services...");
    let rag = Arc::new(EstateRag::new(config).await.context("failed to initialize services")?);
    info!("Services initialized");

    let app = create_app(AppState::new(rag));

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", bind_addr))?;

    info!("estate-rag server is running at http://{}", bind_addr);
    info!("Health check available at: http://{}/health", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
