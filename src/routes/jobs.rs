//! Job route handlers
//!
//! Submission, status, review feedback and artifact retrieval.

use crate::error::{validation_error, ApiResult, AppError};
use crate::metrics;
use crate::models::{
    FeedbackRequest, JobListResponse, JobResponse, JobView, ListJobsQuery, SubmitJobRequest,
    SuccessResponse,
};
use crate::pipeline::{ArtifactLink, ResolvedArtifact};
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use tracing::{debug, warn};
use uuid::Uuid;
use validator::Validate;

/// Submit a new job
pub async fn submit_job(
    State(state): State<SharedState>,
    Json(payload): Json<SubmitJobRequest>,
) -> ApiResult<(StatusCode, Json<SuccessResponse<JobResponse>>)> {
    // Validate input
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    if state.submissions.check().is_err() {
        warn!("Submission rate limit exceeded");
        metrics::record_rate_limit_hit("submit_job");
        return Err(AppError::RateLimited(
            "Too many submissions. Please try again later.".to_string(),
        ));
    }

    let job = state
        .pipeline
        .submit(payload.source_url, payload.music_track)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(SuccessResponse::with_data(
            "Job queued.",
            JobResponse { job: job.into() },
        )),
    ))
}

/// List jobs, newest first
pub async fn list_jobs(
    State(state): State<SharedState>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<SuccessResponse<JobListResponse>>> {
    let filter = query.to_filter()?;
    let jobs = state.pipeline.list(&filter).await;

    let next_before = match filter.limit {
        Some(limit) if jobs.len() == limit => jobs.last().map(|job| job.created_at),
        _ => None,
    };
    let jobs: Vec<JobView> = jobs.iter().map(JobView::from).collect();

    Ok(Json(SuccessResponse::with_data(
        format!("{} job(s).", jobs.len()),
        JobListResponse {
            count: jobs.len(),
            jobs,
            next_before,
        },
    )))
}

/// Get a job's status, progress and stage history
pub async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<JobResponse>>> {
    let job = state.pipeline.status(id).await?;

    Ok(Json(SuccessResponse::with_data(
        format!("Job is {}.", job.status),
        JobResponse { job: job.into() },
    )))
}

/// Mark a delivered job as under review
pub async fn begin_review(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<JobResponse>>> {
    let job = state.pipeline.begin_review(id).await?;
    debug!(job_id = %id, "Review started");

    Ok(Json(SuccessResponse::with_data(
        "Review started.",
        JobResponse { job: job.into() },
    )))
}

/// Submit review feedback for a delivered job
pub async fn submit_feedback(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<FeedbackRequest>,
) -> ApiResult<Json<SuccessResponse<JobResponse>>> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;
    let outcome = payload.into_outcome()?;
    let kind = outcome.kind();

    let job = state.pipeline.submit_feedback(id, outcome).await?;
    debug!(job_id = %id, outcome = kind, "Feedback request handled");

    Ok(Json(SuccessResponse::with_data(
        format!("Feedback recorded, job is {}.", job.status),
        JobResponse { job: job.into() },
    )))
}

/// Issue a signed, time-bounded link to the delivered artifact
pub async fn artifact_link(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<ArtifactLink>>> {
    let link = state.pipeline.artifact_link(id).await?;

    Ok(Json(SuccessResponse::with_data(
        format!("Link valid for {} seconds.", link.expires_in_secs),
        link,
    )))
}

/// Resolve a signed link back to the artifact it grants
pub async fn resolve_artifact(
    State(state): State<SharedState>,
    Path(token): Path<String>,
) -> ApiResult<Json<SuccessResponse<ResolvedArtifact>>> {
    let artifact = state.pipeline.resolve_link(&token).await?;

    Ok(Json(SuccessResponse::with_data("Artifact available.", artifact)))
}
