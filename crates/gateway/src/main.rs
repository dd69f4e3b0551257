//! Gateway service entry point.
//!
//! WebSocket gateway for live call updates.

use anyhow::{Context, Result};
use gateway::{
    create_router, AppState, ConnectionRegistry, GatewayConfig, MessageRouter, RouterConfig,
    TranscriptProcessor,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Gateway service");

    let config = GatewayConfig::from_env().context("invalid gateway configuration")?;

    info!("Configuration:");
    info!("  HTTP_PORT: {}", config.http_port);
    info!("  METRICS_PORT: {}", config.metrics_port);
    info!("  CLIENT_QUEUE_CAPACITY: {}", config.client_queue_capacity);
    info!("  INGEST_CAPACITY: {}", config.ingest_capacity);
    info!("  PING_INTERVAL: {:?}", config.ping_interval);
    info!("  STALE_CLIENT_TIMEOUT: {:?}", config.stale_client_timeout);

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .context("failed to start Prometheus exporter")?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    let registry = Arc::new(ConnectionRegistry::with_queue_capacity(
        config.client_queue_capacity,
    ));

    let router = Arc::new(MessageRouter::new(
        registry.clone(),
        RouterConfig {
            max_latency_ms: config.max_latency_ms,
        },
    ));

    // Ingest channel: producers → router
    let (updates_tx, updates_rx) = mpsc::channel(config.ingest_capacity);

    // Create shutdown channel for router
    let (router_shutdown_tx, router_shutdown_rx) = mpsc::channel(1);

    // Spawn router task
    let router_clone = router.clone();
    let router_handle = tokio::spawn(async move {
        if let Err(e) = router_clone.run(updates_rx, router_shutdown_rx).await {
            error!("Router error: {:?}", e);
        }
    });

    // Evict connections that stopped answering pings
    let cleanup_registry = registry.clone();
    let stale_timeout = config.stale_client_timeout;
    let cleanup_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(stale_timeout / 2);
        loop {
            ticker.tick().await;
            let removed = cleanup_registry.cleanup_stale(stale_timeout.as_millis() as i64);
            if !removed.is_empty() {
                warn!("Evicted {} stale connections", removed.len());
            }
        }
    });

    let state = Arc::new(AppState {
        registry: registry.clone(),
        router,
        processor: Arc::new(TranscriptProcessor::new()),
        updates_tx,
        ping_interval: config.ping_interval,
    });

    let app = create_router(state);

    // Start HTTP server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Shutdown router
    info!("Shutting down router...");
    let _ = router_shutdown_tx.send(()).await;
    let _ = router_handle.await;
    cleanup_handle.abort();
    registry.drain();

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
