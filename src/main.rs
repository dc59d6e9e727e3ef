//! Reel Pipeline - automated reel editing service
//!
//! Takes a source video and a music track through four fixed stages
//! (download, scene analysis, music mix, render), delivers the rendered reel
//! behind a signed time-bounded link and routes reviewer feedback back into
//! the pipeline. Delivered artifacts expire after their TTL and terminal job
//! records are purged after the archive TTL.

mod auth;
mod clock;
mod config;
mod error;
mod jobs;
mod metrics;
mod models;
mod pipeline;
mod routes;
mod state;

use crate::clock::SystemClock;
use crate::config::Settings;
use crate::pipeline::local::local_collaborators;
use crate::pipeline::Pipeline;
use crate::routes::create_router;
use crate::state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber for structured logging
    init_tracing();

    info!("🚀 Starting Reel Pipeline...");

    // Load configuration
    let settings = Settings::load()?;
    info!("📋 Configuration loaded successfully");
    if settings.uses_dev_secrets() {
        warn!("⚠️  JWT or artifact signing secret is the built-in default (INSECURE - set in production!)");
    }

    let metrics_handle = metrics::init_metrics()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    // Assemble the pipeline around the local collaborators
    let collaborators = local_collaborators(
        settings.pipeline.work_dir.clone(),
        settings.pipeline.music_dir.clone(),
        Duration::from_millis(settings.pipeline.simulated_latency_ms),
    );
    let pipeline = Pipeline::new(
        collaborators,
        settings.pipeline_config(),
        Arc::new(SystemClock),
    );
    let scheduler = pipeline.scheduler().clone();
    let retention = pipeline.retention().clone();
    info!(
        "⚙️  Pipeline ready (max {} concurrent stages, {} render(s), {} retries per stage)",
        settings.pipeline.max_concurrent_stages,
        settings.pipeline.max_concurrent_renders,
        settings.pipeline.stage_retry_limit
    );

    let state = Arc::new(AppState::new(settings.clone(), pipeline));

    // Background workers
    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));
    let retention_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { retention.run(shutdown).await })
    };

    // Build the router
    let app = create_router(state, &settings, Some(metrics_handle));

    // Create socket address
    let addr = SocketAddr::from((settings.server.host, settings.server.port));

    info!("🌐 Server listening on http://{}", addr);
    info!("");
    info!("📚 API Endpoints:");
    info!("   ─── Jobs ───");
    info!("   POST /api/jobs                          - Submit a job");
    info!("   GET  /api/jobs                          - List jobs (status, before, limit)");
    info!("   GET  /api/jobs/{{id}}                     - Job status and stage history");
    info!("");
    info!("   ─── Review (reviewer token) ───");
    info!("   POST /api/jobs/{{id}}/review              - Start reviewing a delivery");
    info!("   POST /api/jobs/{{id}}/feedback            - Approve or request a revision");
    info!("");
    info!("   ─── Delivery ───");
    info!("   GET  /api/jobs/{{id}}/artifact            - Signed artifact link");
    info!("   GET  /api/artifacts/{{token}}             - Resolve a signed link");
    info!("");
    info!("   ─── Administration (admin token) ───");
    info!("   POST /api/jobs/{{id}}/cancel              - Cancel a job");
    info!("   POST /api/jobs/{{id}}/stages/{{stage}}/run  - Run the pending stage now");
    info!("");
    info!("   GET  /health  |  GET /metrics");
    info!("");

    // Create TCP listener and serve
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop workers; the scheduler drains in-flight stages before returning
    shutdown.cancel();
    if let Err(e) = scheduler_task.await {
        error!("❌ Scheduler task ended abnormally: {}", e);
    }
    if let Err(e) = retention_task.await {
        error!("❌ Retention task ended abnormally: {}", e);
    }

    info!("👋 Server shutdown complete");
    Ok(())
}

/// Initialize tracing, compact for development or JSON with `LOG_FORMAT=json`
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,reel_pipeline=debug,tower_http=debug"));

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            )
            .init();
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
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
        _ = ctrl_c => {
            info!("📴 Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("📴 Received terminate signal, initiating graceful shutdown...");
        },
    }
}
