//! Collaborator seams
//!
//! The media services that do the actual work (download, scene analysis,
//! mixing, rendering), reference validation and artifact hosting live
//! outside this service. The pipeline only talks to them through these traits.

use crate::error::JobError;
use crate::jobs::{HistoryEntry, Job, JobId, Stage};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Everything a stage processor needs to run one attempt
#[derive(Debug, Clone)]
pub struct StageInput {
    pub job_id: JobId,
    pub stage: Stage,
    pub attempt: u32,
    /// Revisions requested before this run
    pub revision: u32,
    pub source_ref: String,
    pub music_ref: String,
    /// Output of the previous stage in the current run
    pub upstream: Option<String>,
    /// Reviewer note when the run was triggered by a revision
    pub revision_note: Option<String>,
}

impl StageInput {
    pub fn for_job(job: &Job, stage: Stage, attempt: u32) -> Self {
        let upstream = stage
            .previous()
            .and_then(|previous| job.stage_output(previous))
            .map(str::to_string);
        let revision_note = job
            .history
            .iter()
            .rev()
            .find_map(|entry| match entry {
                HistoryEntry::Revision(marker) => Some(marker.note.clone()),
                HistoryEntry::Attempt(_) => None,
            })
            .filter(|note| !note.is_empty());

        Self {
            job_id: job.id,
            stage,
            attempt,
            revision: job.revisions(),
            source_ref: job.source_ref.clone(),
            music_ref: job.music_ref.clone(),
            upstream,
            revision_note,
        }
    }
}

/// Failure reported by a stage processor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    #[error("{0}")]
    Failed(String),
}

/// One external media service (downloader, analyzer, mixer, renderer)
#[async_trait]
pub trait StageProcessor: Send + Sync {
    /// Run the stage and return a reference to its output
    async fn process(&self, input: &StageInput) -> Result<String, ProcessorError>;
}

/// Validates submitted references against their owning services
#[async_trait]
pub trait ReferenceResolver: Send + Sync {
    async fn resolve_source(&self, source_ref: &str) -> Result<(), JobError>;
    async fn resolve_music(&self, music_ref: &str) -> Result<(), JobError>;
}

/// Hosts rendered artifacts
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Invalidate the downloadable reference. Revoking twice is not an error.
    async fn revoke(&self, job_id: JobId, artifact_ref: &str);

    async fn is_revoked(&self, artifact_ref: &str) -> bool;
}

/// The full set of collaborators the pipeline is wired with
#[derive(Clone)]
pub struct Collaborators {
    pub download: Arc<dyn StageProcessor>,
    pub analysis: Arc<dyn StageProcessor>,
    pub mix: Arc<dyn StageProcessor>,
    pub render: Arc<dyn StageProcessor>,
    pub resolver: Arc<dyn ReferenceResolver>,
    pub artifacts: Arc<dyn ArtifactStore>,
}

impl Collaborators {
    pub fn processor(&self, stage: Stage) -> &Arc<dyn StageProcessor> {
        match stage {
            Stage::Download => &self.download,
            Stage::Analysis => &self.analysis,
            Stage::Mix => &self.mix,
            Stage::Render => &self.render,
        }
    }
}
