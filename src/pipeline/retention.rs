//! Retention Manager
//!
//! Runs on its own timer, independent of the scheduler:
//! - expires delivered artifacts once their TTL has passed (job → `Archived`)
//! - purges terminal job records once they exceed the archive TTL
//!
//! Both sweeps are idempotent.

use crate::clock::SharedClock;
use crate::error::JobError;
use crate::jobs::{JobFilter, JobId, JobStatus, JobStore};
use crate::metrics;
use crate::pipeline::collaborators::ArtifactStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Counts from one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub purged: usize,
}

pub struct RetentionManager {
    store: Arc<JobStore>,
    artifacts: Arc<dyn ArtifactStore>,
    /// How long a terminal job record is kept
    archive_ttl: chrono::Duration,
    sweep_interval: Duration,
    clock: SharedClock,
}

impl RetentionManager {
    pub fn new(
        store: Arc<JobStore>,
        artifacts: Arc<dyn ArtifactStore>,
        archive_ttl: chrono::Duration,
        sweep_interval: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            artifacts,
            archive_ttl,
            sweep_interval,
            clock,
        }
    }

    /// Start the background sweep loop.
    ///
    /// Runs until `shutdown` is cancelled; spawn it as a background task.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Starting retention manager (interval: {:?}, archive ttl: {}s)",
            self.sweep_interval,
            self.archive_ttl.num_seconds()
        );

        let mut ticker = interval(self.sweep_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if report != SweepReport::default() {
                        info!(
                            expired = report.expired,
                            purged = report.purged,
                            "Retention sweep complete"
                        );
                    }
                }
            }
        }
        info!("Retention manager stopped");
    }

    /// One full pass: expire artifacts, then purge old records
    pub async fn sweep(&self) -> SweepReport {
        SweepReport {
            expired: self.sweep_expired_artifacts().await,
            purged: self.purge_archived().await,
        }
    }

    /// Archive every delivered job whose artifact TTL has passed.
    /// Returns the number of artifacts expired by this call.
    pub async fn sweep_expired_artifacts(&self) -> usize {
        let now = self.clock.now();
        let candidates = self
            .store
            .list(&JobFilter {
                statuses: vec![JobStatus::Delivered, JobStatus::UnderReview],
                ..Default::default()
            })
            .await;

        let mut expired = 0;
        for job in candidates.into_iter().filter(|job| job.is_artifact_expired(now)) {
            match self.expire(job.id).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => warn!(job_id = %job.id, error = %e, "Artifact expiry skipped"),
            }
        }
        expired
    }

    /// Expire one job's artifact if it is still live and past its TTL.
    /// Re-checked under the job's write lock, so racing feedback wins cleanly.
    async fn expire(&self, id: JobId) -> Result<bool, JobError> {
        let mut revoked = None;
        let job = self
            .store
            .update(id, None, |job, now| {
                if !job.status.holds_artifact() || !job.is_artifact_expired(now) {
                    return Ok(());
                }
                revoked = job.artifact_ref.clone();
                job.transition_to(JobStatus::Archived, now)
            })
            .await?;

        let Some(artifact_ref) = revoked else {
            return Ok(false);
        };
        self.artifacts.revoke(job.id, &artifact_ref).await;
        metrics::record_artifact_expired();
        metrics::record_job_status(JobStatus::Archived);
        info!(job_id = %job.id, artifact = %artifact_ref, "Artifact expired, job archived");
        Ok(true)
    }

    /// Remove terminal jobs (archived, failed, cancelled) older than the
    /// archive TTL. Returns the number of records removed by this call.
    pub async fn purge_archived(&self) -> usize {
        let now = self.clock.now();
        let terminal = self
            .store
            .list(&JobFilter {
                statuses: JobStatus::ALL
                    .into_iter()
                    .filter(JobStatus::is_terminal)
                    .collect(),
                ..Default::default()
            })
            .await;

        let mut purged = 0;
        for job in terminal {
            let due = job
                .terminal_at()
                .is_some_and(|at| at + self.archive_ttl <= now);
            if due && self.store.purge(job.id).await {
                debug!(job_id = %job.id, status = %job.status, "Job record purged");
                purged += 1;
            }
        }
        if purged > 0 {
            metrics::record_jobs_purged(purged as u64);
        }
        purged
    }
}
