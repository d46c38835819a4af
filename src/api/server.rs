use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{
    clear_rule, delete_rule, disable_rule, enable_rule, get_rule, health_check, list_rules,
    rule_state, stats, upsert_rule, AppState,
};
use crate::config::ServerConfig;
use crate::engine::AlertEngine;
use crate::notify::{LogChannel, NotificationDispatcher, WebhookChannel};
use crate::scheduler::EvaluationScheduler;
use crate::state::{Checkpoint, CheckpointWorker};
use crate::telemetry::HttpTelemetryClient;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the application router
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Rule configuration
        .route("/rules", get(list_rules).post(upsert_rule))
        .route("/rules/:name", get(get_rule).delete(delete_rule))
        .route("/rules/:name/enable", post(enable_rule))
        .route("/rules/:name/disable", post(disable_rule))
        // Alert state
        .route("/rules/:name/state", get(rule_state))
        .route("/rules/:name/clear", post(clear_rule))
        // Stats
        .route("/stats", get(stats))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Build a dispatcher with the log channel and configured webhooks
fn build_dispatcher(config: &ServerConfig) -> Result<NotificationDispatcher, Box<dyn std::error::Error>> {
    let dispatcher = NotificationDispatcher::with_dedup_ttl(config.engine.dedup_ttl);
    dispatcher.register(Arc::new(LogChannel::new("log")));

    for webhook in &config.webhooks {
        let channel = WebhookChannel::new(&webhook.id, &webhook.url, WEBHOOK_TIMEOUT)?;
        tracing::debug!(channel = %webhook.id, url = %channel.url(), "Webhook channel registered");
        dispatcher.register(Arc::new(channel));
    }

    Ok(dispatcher)
}

/// Run the HTTP server and the evaluation scheduler
pub async fn run_server(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize alert engine
    let telemetry = HttpTelemetryClient::new(&config.telemetry_url, config.engine.query_timeout)?;
    tracing::info!(backend = %telemetry.base_url(), "Telemetry client ready");
    let dispatcher = Arc::new(build_dispatcher(&config)?);
    let engine = Arc::new(
        AlertEngine::new(Arc::new(telemetry), dispatcher)
            .with_retry_policy(config.engine.retry_policy()),
    );

    restore_checkpoint(&engine, &config);

    let state = Arc::new(AppState {
        engine: Arc::clone(&engine),
    });

    // Start background workers
    let scheduler = Arc::new(EvaluationScheduler::new(Arc::clone(&engine), &config.engine));
    let scheduler_handle = Arc::clone(&scheduler).start();

    let checkpoint_worker = config.engine.checkpoint_path.as_ref().map(|path| {
        Arc::new(CheckpointWorker::new(
            Arc::clone(&engine),
            path,
            config.engine.checkpoint_interval,
        ))
    });
    let checkpoint_handle = checkpoint_worker
        .as_ref()
        .map(|worker| Arc::clone(worker).start());

    // Build router
    let app = build_router(state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Starting Vigil server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&scheduler)))
        .await?;

    // Let in-flight evaluations finish before the final checkpoint
    if let Err(e) = scheduler_handle.await {
        tracing::error!(error = %e, "Evaluation scheduler task failed");
    }

    if let Some(worker) = checkpoint_worker {
        worker.stop();
        worker.write_once();
    }
    if let Some(handle) = checkpoint_handle {
        handle.abort();
    }

    tracing::info!("Vigil server stopped");
    Ok(())
}

/// Load the configured checkpoint into the engine; returns states restored
pub fn restore_checkpoint(engine: &AlertEngine, config: &ServerConfig) -> usize {
    let Some(path) = &config.engine.checkpoint_path else {
        return 0;
    };

    match Checkpoint::load(path) {
        Ok(Some(checkpoint)) => engine.restore(checkpoint),
        Ok(None) => {
            tracing::info!(path = %path.display(), "No checkpoint found; starting fresh");
            0
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Failed to load checkpoint; starting fresh");
            0
        }
    }
}

async fn shutdown_signal(scheduler: Arc<EvaluationScheduler>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }

    tracing::info!("Shutdown signal received, stopping scheduler...");
    scheduler.stop();
}
