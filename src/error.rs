//! Error handling module
//!
//! `JobError` is the pipeline's domain taxonomy; `AppError` wraps it (and the
//! HTTP-only failures) and renders the JSON error envelope.

use crate::jobs::{JobId, JobStatus, Stage};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

/// Failures raised by the job store and the pipeline components
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Job {0} not found")]
    NotFound(JobId),

    /// Bad input at submission, never retried
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    /// A single stage attempt failed; retried per backoff policy
    #[error("Stage {stage} failed: {detail}")]
    StageFailure { stage: Stage, detail: String },

    /// Terminal: the job moved to `Failed`
    #[error("Stage {stage} failed {attempts} consecutive times, job abandoned")]
    RetriesExhausted { stage: Stage, attempts: u32 },

    /// Optimistic concurrency conflict, re-read and retry
    #[error("Stale write: expected version {expected}, found {actual}")]
    StaleWrite { expected: u64, actual: u64 },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Artifact expired: {0}")]
    Expired(String),
}

impl JobError {
    /// Stable machine-readable code for the error envelope
    pub fn code(&self) -> &'static str {
        match self {
            JobError::NotFound(_) => "NOT_FOUND",
            JobError::InvalidReference(_) => "INVALID_REFERENCE",
            JobError::StageFailure { .. } => "STAGE_FAILURE",
            JobError::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            JobError::StaleWrite { .. } => "STALE_WRITE",
            JobError::InvalidState(_) => "INVALID_STATE",
            JobError::InvalidTransition { .. } => "INVALID_TRANSITION",
            JobError::Expired(_) => "EXPIRED",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            JobError::NotFound(_) => StatusCode::NOT_FOUND,
            JobError::InvalidReference(_) => StatusCode::BAD_REQUEST,
            JobError::StageFailure { .. } => StatusCode::BAD_GATEWAY,
            JobError::RetriesExhausted { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            JobError::StaleWrite { .. }
            | JobError::InvalidState(_)
            | JobError::InvalidTransition { .. } => StatusCode::CONFLICT,
            JobError::Expired(_) => StatusCode::GONE,
        }
    }
}

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Job(#[from] JobError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Too many requests: {0}")]
    RateLimited(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match &self {
            AppError::Job(e) => {
                if matches!(e, JobError::StaleWrite { .. }) {
                    warn!("Concurrent modification surfaced to client: {}", e);
                }
                (e.status_code(), e.code(), e.to_string(), None)
            }
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                None,
            ),
            AppError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                msg.clone(),
                None,
            ),
            AppError::Forbidden(msg) => (
                StatusCode::FORBIDDEN,
                "FORBIDDEN",
                msg.clone(),
                None,
            ),
            AppError::RateLimited(msg) => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                msg.clone(),
                None,
            ),
            AppError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                    Some(msg.clone()),
                )
            }
        };

        let body = Json(ErrorResponse {
            success: false,
            message,
            error: details,
            code: Some(error_code.to_string()),
        });

        (status, body).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, AppError>;

/// Helper function to create a validation error
pub fn validation_error(msg: impl Into<String>) -> AppError {
    AppError::Validation(msg.into())
}
