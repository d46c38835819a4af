//! Vigil Server
//!
//! Run with: cargo run
//!
//! Environment variables:
//! - VIGIL_HOST: Bind address (default: 0.0.0.0)
//! - VIGIL_PORT: Port number (default: 8090)
//! - VIGIL_TELEMETRY_URL: Telemetry backend base URL (default: http://127.0.0.1:8080)
//! - VIGIL_WEBHOOKS: Webhook channels as comma-separated id=url pairs
//! - VIGIL_TICK_MS: Scheduler tick resolution (default: 250)
//! - VIGIL_MAX_CONCURRENCY: Concurrent evaluations (default: 4 per CPU)
//! - VIGIL_QUERY_TIMEOUT_SECS: Per-attempt query timeout (default: 30)
//! - VIGIL_QUERY_ATTEMPTS: Query attempts per evaluation (default: 3)
//! - VIGIL_RETRY_BASE_MS: First retry delay (default: 200)
//! - VIGIL_SHUTDOWN_GRACE_SECS: Wait for in-flight evaluations (default: 10)
//! - VIGIL_DEDUP_TTL_SECS: How long dispatched transitions are remembered (default: 86400)
//! - VIGIL_CHECKPOINT_PATH: Rule state checkpoint file (default: disabled)
//! - VIGIL_CHECKPOINT_INTERVAL_SECS: Checkpoint interval (default: 60)
//! - RUST_LOG: Log level (default: info)

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil::api::run_server;
use vigil::config::ServerConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vigil=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env();
    let engine = &config.engine;

    tracing::info!("Vigil configuration:");
    tracing::info!("  Host: {}:{}", config.host, config.port);
    tracing::info!("  Telemetry backend: {}", config.telemetry_url);
    tracing::info!("  Tick resolution: {:?}", engine.tick_resolution);
    tracing::info!("  Max concurrent evaluations: {}", engine.max_concurrency);
    tracing::info!(
        "  Query timeout: {:?} ({} attempts)",
        engine.query_timeout,
        engine.max_query_attempts
    );
    tracing::info!("  Shutdown grace: {:?}", engine.shutdown_grace);

    match &engine.checkpoint_path {
        Some(path) => tracing::info!(
            "  Checkpoint: {} every {:?}",
            path.display(),
            engine.checkpoint_interval
        ),
        None => tracing::info!("  Checkpoint: DISABLED"),
    }

    tracing::info!("  Channels: log + {} webhook(s)", config.webhooks.len());
    for webhook in &config.webhooks {
        tracing::info!("    - {} @ {}", webhook.id, webhook.url);
    }

    println!(
        r#"
 __     ___       _ _
 \ \   / (_) __ _(_) |
  \ \ / /| |/ _` | | |
   \ V / | | (_| | | |
    \_/  |_|\__, |_|_|
            |___/

 Threshold & Query Alert Evaluation Engine
 Version: {}
"#,
        env!("CARGO_PKG_VERSION")
    );

    run_server(config).await
}
