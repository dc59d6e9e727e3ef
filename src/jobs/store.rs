//! Job storage
//!
//! In-memory, versioned job store. Every mutation goes through [`JobStore::update`],
//! which applies the change to a copy, checks the record's invariants and only
//! then swaps it in, so a rejected write never leaves a partial job behind.

use crate::clock::SharedClock;
use crate::error::JobError;
use crate::jobs::{HistoryEntry, Job, JobId, JobStatus, StageAttempt};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Extra data carried by a status transition
#[derive(Debug, Clone, Default)]
pub struct TransitionOptions {
    /// Reject the write if the stored version differs
    pub expected_version: Option<u64>,
    /// Rendered output, required when moving to `Delivered`
    pub artifact_ref: Option<String>,
    /// Lifetime of the delivered artifact
    pub delivery_ttl: Option<Duration>,
}

impl TransitionOptions {
    pub fn at_version(version: u64) -> Self {
        Self {
            expected_version: Some(version),
            ..Default::default()
        }
    }

    pub fn delivery(version: u64, artifact_ref: impl Into<String>, ttl: Duration) -> Self {
        Self {
            expected_version: Some(version),
            artifact_ref: Some(artifact_ref.into()),
            delivery_ttl: Some(ttl),
        }
    }
}

/// Listing filter, newest jobs first
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Keep only these statuses (empty keeps everything)
    pub statuses: Vec<JobStatus>,
    /// Only jobs created strictly before this instant
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Shared handle to one job record; the mutex is the per-job write lock
type JobSlot = Arc<Mutex<Job>>;

/// Thread-safe job store
pub struct JobStore {
    jobs: Arc<RwLock<HashMap<JobId, JobSlot>>>,
    clock: SharedClock,
}

impl JobStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    async fn slot(&self, id: JobId) -> Result<JobSlot, JobError> {
        let jobs = self.jobs.read().await;
        jobs.get(&id).cloned().ok_or(JobError::NotFound(id))
    }

    /// Create a new `Queued` job. References are assumed already validated.
    pub async fn create(&self, source_ref: String, music_ref: String) -> Job {
        let job = Job::new(source_ref, music_ref, self.clock.now());
        let mut jobs = self.jobs.write().await;
        jobs.insert(job.id, Arc::new(Mutex::new(job.clone())));
        debug!(job_id = %job.id, "Job created");
        job
    }

    /// Snapshot of a job
    pub async fn get(&self, id: JobId) -> Result<Job, JobError> {
        let slot = self.slot(id).await?;
        let job = slot.lock().await;
        Ok(job.clone())
    }

    /// Atomically apply `mutate` to a job.
    ///
    /// The closure works on a copy; the copy is only stored when the closure
    /// succeeds and the result satisfies [`Job::check_invariants`]. A closure
    /// that leaves the job unchanged does not bump the version.
    pub async fn update<F>(
        &self,
        id: JobId,
        expected_version: Option<u64>,
        mutate: F,
    ) -> Result<Job, JobError>
    where
        F: FnOnce(&mut Job, DateTime<Utc>) -> Result<(), JobError>,
    {
        let slot = self.slot(id).await?;
        let mut stored = slot.lock().await;

        if let Some(expected) = expected_version {
            if stored.version != expected {
                return Err(JobError::StaleWrite {
                    expected,
                    actual: stored.version,
                });
            }
        }

        let now = self.clock.now();
        let mut next = stored.clone();
        mutate(&mut next, now)?;

        if next == *stored {
            return Ok(next);
        }

        next.check_invariants()?;
        next.version = stored.version + 1;
        next.updated_at = now;
        *stored = next.clone();
        Ok(next)
    }

    /// Append a stage attempt to a `Processing` job
    pub async fn append_attempt(
        &self,
        id: JobId,
        expected_version: u64,
        attempt: StageAttempt,
    ) -> Result<Job, JobError> {
        self.update(id, Some(expected_version), |job, _| {
            if job.status != JobStatus::Processing {
                return Err(JobError::InvalidState(format!(
                    "cannot record {} attempt on a {} job",
                    attempt.stage, job.status
                )));
            }
            job.current_stage = attempt.stage;
            job.history.push(HistoryEntry::Attempt(attempt));
            Ok(())
        })
        .await
    }

    /// Move a job along the status state machine
    pub async fn transition(
        &self,
        id: JobId,
        to: JobStatus,
        options: TransitionOptions,
    ) -> Result<Job, JobError> {
        self.update(id, options.expected_version, |job, now| {
            job.transition_to(to, now)?;
            if to == JobStatus::Delivered {
                let artifact_ref = options.artifact_ref.ok_or_else(|| {
                    JobError::InvalidState("delivery requires an artifact reference".to_string())
                })?;
                let ttl = options.delivery_ttl.ok_or_else(|| {
                    JobError::InvalidState("delivery requires an artifact ttl".to_string())
                })?;
                job.artifact_ref = Some(artifact_ref);
                job.delivered_at = Some(now);
                job.expires_at = Some(now + ttl);
            }
            Ok(())
        })
        .await
    }

    /// Snapshots matching `filter`, newest first (ties broken by id, descending)
    pub async fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let slots: Vec<JobSlot> = {
            let jobs = self.jobs.read().await;
            jobs.values().cloned().collect()
        };

        let mut matching = Vec::new();
        for slot in slots {
            let job = slot.lock().await;
            if !filter.statuses.is_empty() && !filter.statuses.contains(&job.status) {
                continue;
            }
            if filter.before.is_some_and(|before| job.created_at >= before) {
                continue;
            }
            matching.push(job.clone());
        }
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        matching
    }

    /// Remove a job entirely. Returns whether it existed.
    pub async fn purge(&self, id: JobId) -> bool {
        let mut jobs = self.jobs.write().await;
        jobs.remove(&id).is_some()
    }

    /// Get job count
    pub async fn count(&self) -> usize {
        let jobs = self.jobs.read().await;
        jobs.len()
    }
}
