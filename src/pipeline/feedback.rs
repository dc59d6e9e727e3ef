//! Feedback Router
//!
//! Applies a reviewer's verdict to a delivered job: approval archives it,
//! a revision request clears the artifact and sends the job back into the
//! scheduler at the requested stage.

use crate::error::JobError;
use crate::jobs::{
    FeedbackOutcome, FeedbackRecord, HistoryEntry, Job, JobId, JobStatus, JobStore,
    RevisionMarker, TransitionOptions,
};
use crate::metrics;
use crate::pipeline::collaborators::ArtifactStore;
use crate::pipeline::scheduler::Scheduler;
use std::sync::Arc;
use tracing::{info, warn};

pub struct FeedbackRouter {
    store: Arc<JobStore>,
    scheduler: Arc<Scheduler>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl FeedbackRouter {
    pub fn new(
        store: Arc<JobStore>,
        scheduler: Arc<Scheduler>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            store,
            scheduler,
            artifacts,
        }
    }

    /// Mark a delivered job as being reviewed
    pub async fn begin_review(&self, id: JobId) -> Result<Job, JobError> {
        let job = self
            .store
            .transition(id, JobStatus::UnderReview, TransitionOptions::default())
            .await
            .map_err(|e| match e {
                JobError::InvalidTransition { from, .. } => {
                    JobError::InvalidState(format!("job {} is {}, not delivered", id, from))
                }
                other => other,
            })?;
        metrics::record_job_status(JobStatus::UnderReview);
        info!(job_id = %id, "Review started");
        Ok(job)
    }

    /// Apply a review outcome. The outcome is consumed; only `Delivered` and
    /// `UnderReview` jobs accept feedback and anything else is left untouched.
    pub async fn submit_feedback(
        &self,
        id: JobId,
        outcome: FeedbackOutcome,
    ) -> Result<Job, JobError> {
        let kind = outcome.kind();
        let mut revoked = None;

        let job = self
            .store
            .update(id, None, |job, now| {
                if !job.status.accepts_feedback() {
                    return Err(JobError::InvalidState(format!(
                        "job {} is {}, feedback is only accepted after delivery",
                        job.id, job.status
                    )));
                }
                revoked = job.artifact_ref.clone();

                match &outcome {
                    FeedbackOutcome::Approved | FeedbackOutcome::ApprovedWithNote { .. } => {
                        job.transition_to(JobStatus::Approved, now)?;
                        job.transition_to(JobStatus::Archived, now)?;
                    }
                    FeedbackOutcome::ReviseRequested {
                        note,
                        reentry_stage,
                    } => {
                        job.transition_to(JobStatus::RevisionRequested, now)?;
                        job.history.push(HistoryEntry::Revision(RevisionMarker {
                            note: note.clone(),
                            reentry_stage: *reentry_stage,
                            at: now,
                        }));
                        job.current_stage = *reentry_stage;
                        job.expires_at = None;
                        job.delivered_at = None;
                        job.transition_to(JobStatus::Processing, now)?;
                    }
                }

                job.feedback = Some(FeedbackRecord {
                    outcome,
                    submitted_at: now,
                });
                Ok(())
            })
            .await?;

        if let Some(artifact_ref) = &revoked {
            self.artifacts.revoke(job.id, artifact_ref).await;
        }
        metrics::record_job_status(job.status);
        info!(
            job_id = %job.id,
            feedback = kind,
            status = %job.status,
            "Feedback applied"
        );

        if job.status == JobStatus::Processing {
            // The job is already Processing in the store; a failed enqueue is
            // picked up by the scheduler's reconciliation.
            if let Err(e) = self.scheduler.enqueue(&job).await {
                warn!(job_id = %job.id, error = %e, "Re-entry enqueue failed");
            }
        }
        Ok(job)
    }
}
