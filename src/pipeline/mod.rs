//! Reel Pipeline Module
//!
//! The automated edit runs every job through four fixed stages:
//!
//! 1. **Download**: fetch the source video
//! 2. **Analysis**: scene detection
//! 3. **Mix**: lay the music track against the cuts
//! 4. **Render**: encode the reel, which is then delivered for review
//!
//! [`Pipeline`] wires the scheduler, feedback router, retention manager and
//! signed delivery links around one job store.

pub mod collaborators;
pub mod delivery;
pub mod feedback;
pub mod local;
pub mod queue;
pub mod retention;
pub mod retry;
pub mod runner;
pub mod scheduler;

#[cfg(test)]
mod scenario_tests;

pub use collaborators::{Collaborators, ReferenceResolver};
pub use delivery::{ArtifactLink, ArtifactLinks, DeliveryError, ResolvedArtifact};
pub use retention::RetentionManager;
pub use runner::StageTimeouts;
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerLoad, UnitReport};

use crate::clock::SharedClock;
use crate::error::JobError;
use crate::jobs::{FeedbackOutcome, Job, JobFilter, JobId, JobStatus, JobStore, Stage};
use crate::metrics;
use collaborators::ArtifactStore;
use feedback::FeedbackRouter;
use runner::StageRunner;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Everything tunable about the pipeline
#[derive(Clone)]
pub struct PipelineConfig {
    pub scheduler: SchedulerConfig,
    pub timeouts: StageTimeouts,
    /// How long terminal job records are kept
    pub archive_ttl: chrono::Duration,
    pub sweep_interval: Duration,
    pub links: ArtifactLinks,
}

/// The assembled job pipeline
pub struct Pipeline {
    store: Arc<JobStore>,
    scheduler: Arc<Scheduler>,
    feedback: FeedbackRouter,
    retention: Arc<RetentionManager>,
    links: ArtifactLinks,
    resolver: Arc<dyn ReferenceResolver>,
    artifacts: Arc<dyn ArtifactStore>,
    clock: SharedClock,
}

impl Pipeline {
    pub fn new(collaborators: Collaborators, config: PipelineConfig, clock: SharedClock) -> Self {
        let store = Arc::new(JobStore::new(clock.clone()));
        let runner = StageRunner::new(
            store.clone(),
            collaborators.clone(),
            config.timeouts,
            clock.clone(),
        );
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            runner,
            config.scheduler,
            clock.clone(),
        ));
        let feedback = FeedbackRouter::new(
            store.clone(),
            scheduler.clone(),
            collaborators.artifacts.clone(),
        );
        let retention = Arc::new(RetentionManager::new(
            store.clone(),
            collaborators.artifacts.clone(),
            config.archive_ttl,
            config.sweep_interval,
            clock.clone(),
        ));

        Self {
            store,
            scheduler,
            feedback,
            retention,
            links: config.links,
            resolver: collaborators.resolver,
            artifacts: collaborators.artifacts,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn retention(&self) -> &Arc<RetentionManager> {
        &self.retention
    }

    /// Validate both references, create a `Queued` job and queue its first stage
    pub async fn submit(&self, source_ref: String, music_ref: String) -> Result<Job, JobError> {
        self.resolver.resolve_source(&source_ref).await?;
        self.resolver.resolve_music(&music_ref).await?;

        let job = self.store.create(source_ref, music_ref).await;
        metrics::record_job_status(JobStatus::Queued);
        self.scheduler.enqueue(&job).await?;
        info!(job_id = %job.id, source = %job.source_ref, music = %job.music_ref, "Job submitted");
        Ok(job)
    }

    pub async fn status(&self, id: JobId) -> Result<Job, JobError> {
        self.store.get(id).await
    }

    pub async fn list(&self, filter: &JobFilter) -> Vec<Job> {
        self.store.list(filter).await
    }

    pub async fn begin_review(&self, id: JobId) -> Result<Job, JobError> {
        self.feedback.begin_review(id).await
    }

    pub async fn submit_feedback(
        &self,
        id: JobId,
        outcome: FeedbackOutcome,
    ) -> Result<Job, JobError> {
        self.feedback.submit_feedback(id, outcome).await
    }

    /// Signed, time-bounded link to a delivered artifact
    pub async fn artifact_link(&self, id: JobId) -> Result<ArtifactLink, DeliveryError> {
        let job = self.store.get(id).await?;
        self.links.issue(&job, self.clock.now())
    }

    /// Resolve a signed link; revoked artifacts count as expired
    pub async fn resolve_link(&self, token: &str) -> Result<ResolvedArtifact, DeliveryError> {
        let resolved = self.links.resolve(token, self.clock.now(), &self.store).await?;
        if self.artifacts.is_revoked(&resolved.artifact_ref).await {
            return Err(JobError::Expired(format!(
                "artifact for job {} has been revoked",
                resolved.job_id
            ))
            .into());
        }
        Ok(resolved)
    }

    /// Administrator cancellation
    pub async fn cancel(&self, id: JobId) -> Result<Job, JobError> {
        self.scheduler.cancel(id).await
    }

    /// Administrator manual stage execution
    pub async fn run_stage(&self, id: JobId, stage: Stage) -> Result<UnitReport, JobError> {
        self.scheduler.run_stage(id, stage).await
    }
}
