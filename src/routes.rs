//! Route definitions and router setup
//!
//! Configures all API routes and middleware.

mod admin;
mod jobs;


use crate::auth::{require_admin, require_reviewer};
use crate::config::Settings;
use crate::models::HealthResponse;
use crate::state::SharedState;
use axum::{
    extract::State,
    http::{header, Method},
    middleware::from_fn_with_state,
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::MakeRequestUuid,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
    ServiceBuilderExt,
};
use tracing::Level;

/// Create the application router with all routes and middleware
pub fn create_router(
    state: SharedState,
    settings: &Settings,
    metrics_handle: Option<PrometheusHandle>,
) -> Router {
    // Build CORS layer
    let cors = build_cors_layer(settings);

    // Build tracing/logging layer
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    // Build middleware stack
    let middleware = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(trace_layer)
        .layer(CompressionLayer::new())
        .layer(cors)
        .propagate_x_request_id();

    // Review routes, Bearer token with the reviewer or admin role required
    let review_routes = Router::new()
        .route("/api/jobs/{id}/review", post(jobs::begin_review))
        .route("/api/jobs/{id}/feedback", post(jobs::submit_feedback))
        .route_layer(from_fn_with_state(state.clone(), require_reviewer));

    // Administrator routes, Bearer token with the admin role required
    let admin_routes = Router::new()
        .route("/api/jobs/{id}/cancel", post(admin::cancel_job))
        .route("/api/jobs/{id}/stages/{stage}/run", post(admin::run_stage))
        .route_layer(from_fn_with_state(state.clone(), require_admin));

    let metrics_routes = match metrics_handle {
        Some(handle) => Router::new().route("/metrics", get(move || async move { handle.render() })),
        None => Router::new(),
    };

    // Build the router
    Router::new()
        // Health check
        .route("/health", get(health_check))

        // Job routes
        .route("/api/jobs", post(jobs::submit_job).get(jobs::list_jobs))
        .route("/api/jobs/{id}", get(jobs::get_job))
        .route("/api/jobs/{id}/artifact", get(jobs::artifact_link))

        // Signed artifact links
        .route("/api/artifacts/{token}", get(jobs::resolve_artifact))

        .merge(review_routes)
        .merge(admin_routes)
        .merge(metrics_routes)

        // Apply middleware and state
        .layer(middleware)
        .with_state(state)
}

/// Build CORS layer from settings
fn build_cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<_> = settings
        .cors
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    let cors = if origins.is_empty() {
        CorsLayer::new().allow_origin(Any)
    } else {
        CorsLayer::new().allow_origin(origins)
    };

    cors.allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
        .max_age(Duration::from_secs(3600))
}

/// Health check endpoint
async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        jobs: state.pipeline.store().count().await,
        scheduler: state.pipeline.scheduler().load(),
    })
}
