/// Server setup and initialization
///
/// Wires together all components: tag provider, flow registry, execution
/// engine, orchestrator, and HTTP routes.

use crate::{
    api::flows::{create_flow_routes, AppState},
    config::Config,
    flow::registry::FlowRegistry,
    runtime::{
        engine::FlowEngine, executor::ExecutorRegistry, orchestrator::Orchestrator,
        script::ScriptSandbox, triggers::TriggerCoordinator,
    },
    tags::{FlowStateStore, InMemoryTagProvider, TagProvider},
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;

/// Create the main Axum application with all routes
///
/// Initializes all engine components and wires them together. The in-memory
/// tag provider stands in for the external driver layer; callers embedding
/// the engine supply their own through `create_app_with_tags`.
pub async fn create_app(config: Config) -> Result<(Router, Arc<Orchestrator>)> {
    let tags: Arc<dyn TagProvider> = Arc::new(InMemoryTagProvider::new());
    create_app_with_tags(config, tags).await
}

/// Create the application against a caller-supplied tag provider.
pub async fn create_app_with_tags(
    config: Config,
    tags: Arc<dyn TagProvider>,
) -> Result<(Router, Arc<Orchestrator>)> {
    tracing::info!("⚙️ Initializing executor registry");
    let executors = Arc::new(ExecutorRegistry::with_builtins());

    tracing::info!("🚀 Initializing flow engine");
    let sandbox = ScriptSandbox::new(Duration::from_millis(config.engine.script_timeout_ms));
    let engine = Arc::new(FlowEngine::new(
        executors,
        tags,
        Arc::new(FlowStateStore::new()),
        sandbox,
    ));

    tracing::info!("📊 Initializing flow registry");
    let registry = Arc::new(FlowRegistry::new());
    let triggers = Arc::new(TriggerCoordinator::new());

    tracing::info!("🎛️ Initializing orchestrator");
    let orchestrator = Arc::new(
        Orchestrator::new(
            engine,
            registry,
            triggers,
            config.engine.min_scan_interval_ms,
        )
        .await?,
    );
    orchestrator.start().await?;

    let app_state = AppState {
        orchestrator: Arc::clone(&orchestrator),
    };

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let app = Router::new()
        .route("/healthz", get(health_check))
        .merge(create_flow_routes().with_state(app_state));

    tracing::info!("✅ Application initialized successfully");
    Ok((app, orchestrator))
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting Tagflow server...");

    let (app, _orchestrator) = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
