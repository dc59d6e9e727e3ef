//! Administrator route handlers
//!
//! Mounted behind `require_admin`; the verified claims are in the request extensions.

use crate::auth::Claims;
use crate::error::ApiResult;
use crate::jobs::Stage;
use crate::models::{JobResponse, JobView, SuccessResponse};
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

/// Cancel a job, stopping its in-flight stage if any
pub async fn cancel_job(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<JobResponse>>> {
    let job = state.pipeline.cancel(id).await?;
    info!(job_id = %id, admin = %claims.sub, "Job cancelled by administrator");

    Ok(Json(SuccessResponse::with_data(
        "Job cancelled.",
        JobResponse { job: job.into() },
    )))
}

#[derive(Debug, Serialize)]
pub struct StageRunResponse {
    /// What the scheduler did after the stage finished
    pub outcome: &'static str,
    pub job: JobView,
}

/// Run the job's pending stage immediately
pub async fn run_stage(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path((id, stage)): Path<(Uuid, String)>,
) -> ApiResult<Json<SuccessResponse<StageRunResponse>>> {
    let stage: Stage = stage.parse()?;
    info!(job_id = %id, stage = %stage, admin = %claims.sub, "Manual stage run requested");

    let report = state.pipeline.run_stage(id, stage).await?;
    let job = state.pipeline.status(report.job_id()).await?;

    Ok(Json(SuccessResponse::with_data(
        format!("Stage {} finished: {}.", stage, report.kind()),
        StageRunResponse {
            outcome: report.kind(),
            job: job.into(),
        },
    )))
}
