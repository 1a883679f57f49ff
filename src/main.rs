//! tus Upload Server
//!
//! Resumable file uploads over HTTP, speaking tus 1.0.0 with the creation,
//! defer-length, termination, checksum, and expiration extensions.

use std::net::SocketAddr;

use anyhow::Context;
use axum::http::Method;
use axum::Router;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tus_upload_server::config::Config;
use tus_upload_server::routes::{self, setup_tus, EXPOSED_HEADERS};
use tus_upload_server::state::AppState;
use tus_upload_server::tus::TusService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tus_upload_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting tus upload server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Upload path: {}", config.tus.upload_path.display());
    tracing::info!("Upload URL: {}", config.tus.upload_url);

    let tus = TusService::open(config.tus.clone())
        .await
        .with_context(|| {
            format!(
                "failed to open upload directory {}",
                config.tus.upload_path.display()
            )
        })?;

    let drifted = tus.check_integrity().await;
    if !drifted.is_empty() {
        tracing::warn!(
            count = drifted.len(),
            "Uploads with stored length differing from their offset; next append repairs the tail"
        );
    }

    tus.sweep_expired().await;
    tus.clone().spawn_sweeper();

    let app_state = AppState::new(config.clone(), tus.clone());

    // tus clients read protocol headers cross-origin
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::HEAD,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
        .expose_headers(EXPOSED_HEADERS);

    // Build router
    let app = Router::new()
        .nest("/health", routes::health::router())
        .merge(setup_tus(tus))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state);

    // Start server with graceful shutdown
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("invalid listen address {}", config.server.host))?;
    tracing::info!("tus upload server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
