//! Job-related models and DTOs

use crate::error::{validation_error, AppError};
use crate::jobs::{FeedbackOutcome, FeedbackRecord, HistoryEntry, Job, JobFilter, JobId, JobStatus, Stage};
use crate::pipeline::SchedulerLoad;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Default and maximum page size for job listings
pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 200;

/// Request to submit a new editing job
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    /// Source video URL
    #[validate(url(message = "sourceUrl must be a valid URL"))]
    #[validate(length(max = 2048, message = "sourceUrl is too long"))]
    pub source_url: String,

    /// Music library track id
    #[validate(length(min = 1, max = 128, message = "musicTrack must be between 1 and 128 characters"))]
    pub music_track: String,
}

/// Review verdict as sent by the client
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRequest {
    /// `approved`, `approved_with_note` or `revise_requested`
    #[validate(length(min = 1, message = "outcome is required"))]
    pub outcome: String,

    #[validate(length(max = 4000, message = "note must be at most 4000 characters"))]
    pub note: Option<String>,

    /// Stage to re-run from, required for revisions
    pub reentry_stage: Option<String>,
}

impl FeedbackRequest {
    /// Turn the wire form into a domain outcome.
    ///
    /// An unknown re-entry stage is an `InvalidState` job error rather than a
    /// validation error, matching what the router reports for a bad stage.
    pub fn into_outcome(self) -> Result<FeedbackOutcome, AppError> {
        let note = self.note.map(|n| n.trim().to_string()).unwrap_or_default();
        match self.outcome.trim() {
            "approved" => Ok(FeedbackOutcome::Approved),
            "approved_with_note" => {
                if note.is_empty() {
                    return Err(validation_error("approved_with_note requires a note"));
                }
                Ok(FeedbackOutcome::ApprovedWithNote { note })
            }
            "revise_requested" => {
                let raw = self
                    .reentry_stage
                    .ok_or_else(|| validation_error("revise_requested requires reentryStage"))?;
                let reentry_stage: Stage = raw.parse()?;
                Ok(FeedbackOutcome::ReviseRequested { note, reentry_stage })
            }
            other => Err(validation_error(format!("Unknown feedback outcome '{}'", other))),
        }
    }
}

/// Query string of `GET /api/jobs`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsQuery {
    /// Comma-separated statuses
    pub status: Option<String>,
    /// Only jobs created before this instant (pagination cursor)
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ListJobsQuery {
    pub fn to_filter(&self) -> Result<JobFilter, AppError> {
        let statuses = match &self.status {
            Some(raw) => raw
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.parse::<JobStatus>().map_err(|e| validation_error(e.to_string())))
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let limit = self.limit.unwrap_or(DEFAULT_LIST_LIMIT);
        if limit == 0 || limit > MAX_LIST_LIMIT {
            return Err(validation_error(format!(
                "limit must be between 1 and {}",
                MAX_LIST_LIMIT
            )));
        }

        Ok(JobFilter {
            statuses,
            before: self.before,
            limit: Some(limit),
        })
    }
}

/// Client-facing view of a job
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: JobId,
    pub status: JobStatus,
    pub current_stage: Stage,
    /// 0-100, derived from completed stages
    pub progress: u8,
    pub source_ref: String,
    pub music_ref: String,
    pub stage_history: Vec<HistoryEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<FeedbackRecord>,
    /// Why the job failed, when it did
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            current_stage: job.current_stage,
            progress: job.progress(),
            source_ref: job.source_ref.clone(),
            music_ref: job.music_ref.clone(),
            stage_history: job.history.clone(),
            artifact_ref: job.artifact_ref.clone(),
            delivered_at: job.delivered_at,
            expires_at: job.expires_at,
            feedback: job.feedback.clone(),
            error: job.failure().map(|e| e.to_string()),
            created_at: job.created_at,
            updated_at: job.updated_at,
            version: job.version,
        }
    }
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self::from(&job)
    }
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job: JobView,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListResponse {
    pub jobs: Vec<JobView>,
    pub count: usize,
    /// Cursor for the next page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_before: Option<DateTime<Utc>>,
}

/// Health check payload
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub jobs: usize,
    pub scheduler: SchedulerLoad,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;
    use pretty_assertions::assert_eq;

    fn feedback(outcome: &str, note: Option<&str>, stage: Option<&str>) -> FeedbackRequest {
        FeedbackRequest {
            outcome: outcome.to_string(),
            note: note.map(str::to_string),
            reentry_stage: stage.map(str::to_string),
        }
    }

    #[test]
    fn test_submit_request_validation() {
        let ok = SubmitJobRequest {
            source_url: "https://videos.example.com/a.mp4".to_string(),
            music_track: "summer_vibes".to_string(),
        };
        assert!(ok.validate().is_ok());

        let bad = SubmitJobRequest {
            source_url: "not a url".to_string(),
            music_track: String::new(),
        };
        let errors = bad.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("source_url"));
        assert!(fields.contains_key("music_track"));
    }

    #[test]
    fn test_feedback_outcomes() {
        assert_eq!(
            feedback("approved", None, None).into_outcome().unwrap(),
            FeedbackOutcome::Approved
        );
        assert_eq!(
            feedback("revise_requested", Some(" tighter cuts "), Some("mix"))
                .into_outcome()
                .unwrap(),
            FeedbackOutcome::ReviseRequested {
                note: "tighter cuts".to_string(),
                reentry_stage: Stage::Mix
            }
        );
    }

    #[test]
    fn test_unknown_reentry_stage_is_invalid_state() {
        let err = feedback("revise_requested", Some("x"), Some("color_grade"))
            .into_outcome()
            .unwrap_err();
        assert!(matches!(err, AppError::Job(JobError::InvalidState(_))));
    }

    #[test]
    fn test_feedback_missing_parts_rejected() {
        assert!(matches!(
            feedback("approved_with_note", Some("  "), None).into_outcome(),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            feedback("revise_requested", Some("x"), None).into_outcome(),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            feedback("rejected", None, None).into_outcome(),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_list_query_filter() {
        let query = ListJobsQuery {
            status: Some("delivered,under_review".to_string()),
            before: None,
            limit: None,
        };
        let filter = query.to_filter().unwrap();
        assert_eq!(filter.statuses, vec![JobStatus::Delivered, JobStatus::UnderReview]);
        assert_eq!(filter.limit, Some(DEFAULT_LIST_LIMIT));

        let query = ListJobsQuery {
            limit: Some(0),
            ..Default::default()
        };
        assert!(query.to_filter().is_err());
    }

    #[test]
    fn test_job_view_serializes_camel_case() {
        let job = Job::new("https://v.example.com/a.mp4".into(), "t1".into(), Utc::now());
        let json = serde_json::to_value(JobView::from(&job)).unwrap();
        assert_eq!(json["status"], "queued");
        assert_eq!(json["currentStage"], "download");
        assert_eq!(json["progress"], 0);
        assert!(json.get("artifactRef").is_none());
    }
}
