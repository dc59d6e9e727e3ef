//! Job data models
//!
//! The job record, its fixed stage sequence and the status state machine.

use crate::error::JobError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque job identifier
pub type JobId = Uuid;

// =============================================================================
// STAGES
// =============================================================================

/// One step of the automated edit, always executed in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Fetch the source video
    Download,
    /// Scene detection over the downloaded video
    Analysis,
    /// Lay the music track against the analyzed cuts
    Mix,
    /// Encode the final reel
    Render,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Download, Stage::Analysis, Stage::Mix, Stage::Render];

    pub fn index(self) -> usize {
        match self {
            Stage::Download => 0,
            Stage::Analysis => 1,
            Stage::Mix => 2,
            Stage::Render => 3,
        }
    }

    pub fn next(self) -> Option<Stage> {
        Stage::ALL.get(self.index() + 1).copied()
    }

    pub fn previous(self) -> Option<Stage> {
        self.index().checked_sub(1).map(|i| Stage::ALL[i])
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Analysis => "analysis",
            Stage::Mix => "mix",
            Stage::Render => "render",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| JobError::InvalidState(format!("Unknown stage '{}'", s)))
    }
}

// =============================================================================
// STATUS STATE MACHINE
// =============================================================================

/// Lifecycle status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted, waiting for its first stage
    #[default]
    Queued,
    /// Stages are being executed
    Processing,
    /// Render finished, artifact downloadable
    Delivered,
    /// A reviewer is looking at the artifact
    UnderReview,
    /// Reviewer accepted the reel
    Approved,
    /// Reviewer asked for another pass
    RevisionRequested,
    /// Retired, artifact gone
    Archived,
    /// Stage retries exhausted
    Failed,
    /// Stopped by an administrator
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 9] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Delivered,
        JobStatus::UnderReview,
        JobStatus::Approved,
        JobStatus::RevisionRequested,
        JobStatus::Archived,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Delivered => "delivered",
            JobStatus::UnderReview => "under_review",
            JobStatus::Approved => "approved",
            JobStatus::RevisionRequested => "revision_requested",
            JobStatus::Archived => "archived",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Edges of the status state machine
    pub fn allowed_transitions(&self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            Queued => &[Processing, Cancelled],
            Processing => &[Delivered, Failed, Cancelled],
            Delivered => &[UnderReview, Approved, RevisionRequested, Archived],
            UnderReview => &[Approved, RevisionRequested, Archived],
            Approved => &[Archived],
            RevisionRequested => &[Processing],
            Archived | Failed | Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }

    /// Statuses the scheduler is allowed to pick work from
    pub fn is_schedulable(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Processing)
    }

    /// Statuses that carry a live artifact
    pub fn holds_artifact(&self) -> bool {
        matches!(self, JobStatus::Delivered | JobStatus::UnderReview)
    }

    pub fn accepts_feedback(&self) -> bool {
        self.holds_artifact()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| JobError::InvalidState(format!("Unknown status '{}'", s)))
    }
}

/// One status change, kept for audit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub from: JobStatus,
    pub to: JobStatus,
    pub at: DateTime<Utc>,
}

// =============================================================================
// HISTORY
// =============================================================================

/// How a stage attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failed,
    Cancelled,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failed => "failed",
            AttemptOutcome::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded stage execution. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageAttempt {
    pub stage: Stage,
    /// 1-based, counted per stage since the last revision
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Present iff the attempt failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Collaborator output reference, present iff the attempt succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl StageAttempt {
    pub fn succeeded(
        stage: Stage,
        attempt: u32,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            attempt,
            outcome: AttemptOutcome::Success,
            started_at,
            finished_at,
            error: None,
            output: Some(output.into()),
        }
    }

    pub fn failed(
        stage: Stage,
        attempt: u32,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            attempt,
            outcome: AttemptOutcome::Failed,
            started_at,
            finished_at,
            error: Some(error.into()),
            output: None,
        }
    }

    pub fn cancelled(
        stage: Stage,
        attempt: u32,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            stage,
            attempt,
            outcome: AttemptOutcome::Cancelled,
            started_at,
            finished_at,
            error: None,
            output: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}

/// Synthetic history entry left by a revision request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionMarker {
    pub note: String,
    pub reentry_stage: Stage,
    pub at: DateTime<Utc>,
}

/// Entry of a job's append-only history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEntry {
    Attempt(StageAttempt),
    Revision(RevisionMarker),
}

// =============================================================================
// FEEDBACK
// =============================================================================

/// Review verdict, consumed once by the feedback router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FeedbackOutcome {
    Approved,
    ApprovedWithNote {
        note: String,
    },
    ReviseRequested {
        note: String,
        #[serde(rename = "reentryStage")]
        reentry_stage: Stage,
    },
}

impl FeedbackOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            FeedbackOutcome::Approved => "approved",
            FeedbackOutcome::ApprovedWithNote { .. } => "approved_with_note",
            FeedbackOutcome::ReviseRequested { .. } => "revise_requested",
        }
    }
}

/// Feedback as retained on the job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRecord {
    pub outcome: FeedbackOutcome,
    pub submitted_at: DateTime<Utc>,
}

// =============================================================================
// JOB
// =============================================================================

/// A reel editing job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    /// Source video URL
    pub source_ref: String,
    /// Music track id
    pub music_ref: String,
    pub status: JobStatus,
    /// Last attempted stage (or the re-entry stage after a revision)
    pub current_stage: Stage,
    pub history: Vec<HistoryEntry>,
    /// Rendered output, present only while the job holds a live artifact
    pub artifact_ref: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub feedback: Option<FeedbackRecord>,
    pub transitions: Vec<StatusChange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    /// Set when the job ends `Failed` or `Cancelled`
    pub finished_at: Option<DateTime<Utc>>,
    /// Bumped on every write, used for optimistic concurrency
    pub version: u64,
}

impl Job {
    pub fn new(source_ref: String, music_ref: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_ref,
            music_ref,
            status: JobStatus::Queued,
            current_stage: Stage::Download,
            history: Vec::new(),
            artifact_ref: None,
            delivered_at: None,
            expires_at: None,
            feedback: None,
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
            archived_at: None,
            finished_at: None,
            version: 0,
        }
    }

    /// Move to `to` if the state machine allows it.
    ///
    /// Leaving an artifact-bearing status drops the artifact reference;
    /// terminal statuses stamp their timestamp.
    pub fn transition_to(&mut self, to: JobStatus, now: DateTime<Utc>) -> Result<(), JobError> {
        if !self.status.can_transition_to(to) {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to,
            });
        }

        self.transitions.push(StatusChange {
            from: self.status,
            to,
            at: now,
        });
        self.status = to;

        if !to.holds_artifact() {
            self.artifact_ref = None;
        }
        match to {
            JobStatus::Archived => self.archived_at = Some(now),
            JobStatus::Failed | JobStatus::Cancelled => self.finished_at = Some(now),
            _ => {}
        }
        Ok(())
    }

    /// History entries since the most recent revision marker
    pub fn current_run(&self) -> &[HistoryEntry] {
        let start = self
            .history
            .iter()
            .rposition(|entry| matches!(entry, HistoryEntry::Revision(_)))
            .map(|pos| pos + 1)
            .unwrap_or(0);
        &self.history[start..]
    }

    /// Revisions requested so far
    pub fn revisions(&self) -> u32 {
        self.history
            .iter()
            .filter(|entry| matches!(entry, HistoryEntry::Revision(_)))
            .count() as u32
    }

    /// Every attempt ever recorded, oldest first
    pub fn attempts(&self) -> impl Iterator<Item = &StageAttempt> {
        self.history.iter().filter_map(|entry| match entry {
            HistoryEntry::Attempt(attempt) => Some(attempt),
            HistoryEntry::Revision(_) => None,
        })
    }

    fn current_run_attempts(&self) -> impl DoubleEndedIterator<Item = &StageAttempt> {
        self.current_run().iter().filter_map(|entry| match entry {
            HistoryEntry::Attempt(attempt) => Some(attempt),
            HistoryEntry::Revision(_) => None,
        })
    }

    /// The stage that must run next, derived from history alone.
    ///
    /// `None` once `Render` has succeeded in the current run.
    pub fn next_stage(&self) -> Option<Stage> {
        match self.history.last() {
            None => Some(Stage::Download),
            Some(HistoryEntry::Revision(marker)) => Some(marker.reentry_stage),
            Some(HistoryEntry::Attempt(attempt)) if attempt.is_success() => attempt.stage.next(),
            Some(HistoryEntry::Attempt(attempt)) => Some(attempt.stage),
        }
    }

    pub fn next_attempt_number(&self, stage: Stage) -> u32 {
        let previous = self.current_run_attempts().filter(|a| a.stage == stage).count();
        previous as u32 + 1
    }

    /// Failed attempts of `stage` at the tail of the current run
    pub fn consecutive_failures(&self, stage: Stage) -> u32 {
        self.current_run_attempts()
            .rev()
            .take_while(|a| a.stage == stage && a.outcome == AttemptOutcome::Failed)
            .count() as u32
    }

    /// Output of the latest successful attempt of `stage`.
    ///
    /// Looks past revision markers, so a run re-entered at `Mix` still sees
    /// the earlier `Analysis` output.
    pub fn stage_output(&self, stage: Stage) -> Option<&str> {
        self.attempts()
            .filter(|a| a.stage == stage && a.is_success())
            .last()
            .and_then(|a| a.output.as_deref())
    }

    /// Percentage of the pipeline completed: every stage before the pending
    /// one counts as done
    pub fn progress(&self) -> u8 {
        match self.status {
            JobStatus::Queued
            | JobStatus::Processing
            | JobStatus::Failed
            | JobStatus::Cancelled => {}
            _ => return 100,
        }
        let done = self.next_stage().map_or(Stage::ALL.len(), Stage::index);
        (done * 100 / Stage::ALL.len()) as u8
    }

    pub fn is_artifact_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    /// When the job entered a terminal status
    pub fn terminal_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            JobStatus::Archived => self.archived_at,
            JobStatus::Failed | JobStatus::Cancelled => self.finished_at,
            _ => None,
        }
    }

    /// The terminal error of a failed job
    pub fn failure(&self) -> Option<JobError> {
        if self.status != JobStatus::Failed {
            return None;
        }
        let stage = self.current_stage;
        Some(JobError::RetriesExhausted {
            stage,
            attempts: self.consecutive_failures(stage),
        })
    }

    /// Structural invariants every persisted job must satisfy
    pub fn check_invariants(&self) -> Result<(), JobError> {
        let holds = self.status.holds_artifact();
        if holds != self.artifact_ref.is_some() {
            return Err(JobError::InvalidState(format!(
                "job {} is {} but artifact is {}",
                self.id,
                self.status,
                if self.artifact_ref.is_some() { "set" } else { "missing" }
            )));
        }
        if holds && self.expires_at.is_none() {
            return Err(JobError::InvalidState(format!(
                "job {} holds an artifact without an expiry",
                self.id
            )));
        }
        Ok(())
    }
}
