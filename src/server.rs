/// Server setup and initialization
///
/// Wires together all components: engine, session manifest, startup cleanup, session
/// registry and HTTP routes. Provides the main application factory function for
/// creating the Axum app.

use crate::{
    api::{create_session_routes, AppState},
    config::Config,
    engine::memory::MemoryEngine,
    session::{SessionManifest, SessionRegistry},
    storage::clear_all,
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Create the main Axum application with all routes
///
/// Opens the session manifest, runs the startup sweep against the engine and builds
/// the router. Returns the registry too so the caller can close sessions on shutdown.
pub async fn create_app(config: Config) -> Result<(Router, Arc<SessionRegistry>)> {
    // Open the manifest inside the data directory
    tracing::info!("📁 Ensuring data directory exists: {}", config.storage.data_dir.display());
    let manifest = SessionManifest::open_in(&config.storage.data_dir)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open session manifest: {}", e))?;

    tracing::info!("🧠 Initializing engine with stores {:?}", config.storage.stores);
    let engine = MemoryEngine::new(config.storage.stores.clone(), config.storage.lock_timeout());
    let handles = engine.handles();

    // Reclaim namespaces of sessions that crashed before closing
    tracing::info!("🧹 Running startup cleanup");
    let report = clear_all(&handles, Some(&manifest), config.cleanup.name_shape_sweep)
        .await
        .map_err(|e| anyhow::anyhow!("Startup cleanup failed: {}", e))?;
    if !report.is_clean() {
        tracing::warn!("⚠️ Startup cleanup left {} namespaces behind", report.failures.len());
    }

    tracing::info!("📊 Initializing session registry");
    let registry = Arc::new(SessionRegistry::new(
        handles,
        config.storage.batch_limits(),
        Some(manifest),
    ));

    let app_state = AppState {
        registry: Arc::clone(&registry),
        page_size: config.storage.page_size,
    };

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let app = Router::new()
        // Health check endpoint
        .route("/healthz", get(health_check))
        // Session administration routes
        .merge(create_session_routes().with_state(app_state));

    tracing::info!("✅ Application initialized successfully");

    Ok((app, registry))
}

/// Start the HTTP server with the given configuration
///
/// Serves until Ctrl-C, then closes every open session so its namespaces are dropped
/// and the manifest marks it closed.
pub async fn start_server(config: Config) -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting stagestore server...");

    let (app, registry) = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("🛑 Shutting down, closing {} open sessions", registry.len());
    registry.close_all().await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
    }
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
