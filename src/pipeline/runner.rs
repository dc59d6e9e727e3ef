//! Stage Runner
//!
//! Runs one stage of one job through its collaborator and records exactly one
//! attempt in the store, whatever the outcome. Retry decisions belong to the
//! scheduler.

use crate::clock::SharedClock;
use crate::error::JobError;
use crate::jobs::{Job, JobStatus, JobStore, Stage, StageAttempt};
use crate::metrics;
use crate::pipeline::collaborators::{Collaborators, StageInput};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Per stage-class time limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub download: Duration,
    /// Analysis, mix and render
    pub processing: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            download: Duration::from_secs(1800),
            processing: Duration::from_secs(600),
        }
    }
}

impl StageTimeouts {
    pub fn for_stage(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Download => self.download,
            Stage::Analysis | Stage::Mix | Stage::Render => self.processing,
        }
    }
}

/// An attempt together with the job as stored right after recording it
#[derive(Debug, Clone)]
pub struct RecordedAttempt {
    pub attempt: StageAttempt,
    pub job: Job,
}

pub struct StageRunner {
    store: Arc<JobStore>,
    collaborators: Collaborators,
    timeouts: StageTimeouts,
    clock: SharedClock,
}

impl StageRunner {
    pub fn new(
        store: Arc<JobStore>,
        collaborators: Collaborators,
        timeouts: StageTimeouts,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            collaborators,
            timeouts,
            clock,
        }
    }

    /// Execute `stage` for `job`.
    ///
    /// `job` is the snapshot the caller acted on; its version guards the write,
    /// so a concurrent writer makes this return `StaleWrite` and the outcome is
    /// not recorded.
    pub async fn run(
        &self,
        job: &Job,
        stage: Stage,
        cancel: &CancellationToken,
    ) -> Result<RecordedAttempt, JobError> {
        if job.status != JobStatus::Processing {
            return Err(JobError::InvalidState(format!(
                "job {} is {}, stages only run while processing",
                job.id, job.status
            )));
        }
        if job.next_stage() != Some(stage) {
            return Err(JobError::InvalidState(format!(
                "job {} cannot run {} now (pending stage: {})",
                job.id,
                stage,
                job.next_stage().map_or("none", Stage::as_str)
            )));
        }

        let number = job.next_attempt_number(stage);
        let input = StageInput::for_job(job, stage, number);
        let limit = self.timeouts.for_stage(stage);
        let processor = self.collaborators.processor(stage);

        info!(job_id = %job.id, stage = %stage, attempt = number, "Stage started");
        let started_at = self.clock.now();
        let timer = Instant::now();

        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                StageAttempt::cancelled(stage, number, started_at, self.clock.now())
            }
            result = tokio::time::timeout(limit, processor.process(&input)) => {
                let finished_at = self.clock.now();
                match result {
                    Ok(Ok(output)) => {
                        StageAttempt::succeeded(stage, number, started_at, finished_at, output)
                    }
                    Ok(Err(e)) => {
                        StageAttempt::failed(stage, number, started_at, finished_at, e.to_string())
                    }
                    Err(_) => StageAttempt::failed(
                        stage,
                        number,
                        started_at,
                        finished_at,
                        format!("timed out after {}s", limit.as_secs()),
                    ),
                }
            }
        };

        let elapsed = timer.elapsed().as_secs_f64();
        metrics::record_stage_attempt(stage, attempt.outcome, elapsed);
        match &attempt.error {
            Some(error) => warn!(
                job_id = %job.id,
                stage = %stage,
                attempt = number,
                error = %error,
                "Stage failed"
            ),
            None => info!(
                job_id = %job.id,
                stage = %stage,
                attempt = number,
                outcome = %attempt.outcome,
                elapsed_secs = elapsed,
                "Stage finished"
            ),
        }

        let job = self
            .store
            .append_attempt(job.id, job.version, attempt.clone())
            .await?;
        Ok(RecordedAttempt { attempt, job })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::jobs::{AttemptOutcome, TransitionOptions};
    use crate::pipeline::collaborators::fakes::{Harness, Step};
    use pretty_assertions::assert_eq;

    struct Fixture {
        store: Arc<JobStore>,
        harness: Harness,
        runner: StageRunner,
    }

    fn fixture(timeouts: StageTimeouts) -> Fixture {
        let clock: SharedClock = Arc::new(FakeClock::new());
        let store = Arc::new(JobStore::new(clock.clone()));
        let harness = Harness::new();
        let runner = StageRunner::new(
            store.clone(),
            harness.collaborators.clone(),
            timeouts,
            clock,
        );
        Fixture {
            store,
            harness,
            runner,
        }
    }

    async fn processing_job(store: &JobStore) -> Job {
        let job = store
            .create("https://cdn.example.com/a.mp4".into(), "track-a".into())
            .await;
        store
            .transition(job.id, JobStatus::Processing, TransitionOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_records_output() {
        let fx = fixture(StageTimeouts::default());
        let job = processing_job(&fx.store).await;

        let recorded = fx
            .runner
            .run(&job, Stage::Download, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(recorded.attempt.outcome, AttemptOutcome::Success);
        assert_eq!(recorded.attempt.attempt, 1);
        assert!(recorded.attempt.output.is_some());
        assert_eq!(recorded.job.history.len(), 1);
        assert_eq!(recorded.job.current_stage, Stage::Download);
        assert_eq!(recorded.job.version, job.version + 1);
    }

    #[tokio::test]
    async fn test_failure_recorded_with_detail() {
        let fx = fixture(StageTimeouts::default());
        fx.harness.script(Stage::Download, Step::Fail("403 from origin"));
        let job = processing_job(&fx.store).await;

        let recorded = fx
            .runner
            .run(&job, Stage::Download, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(recorded.attempt.outcome, AttemptOutcome::Failed);
        assert_eq!(recorded.attempt.error.as_deref(), Some("403 from origin"));
        assert_eq!(recorded.attempt.output, None);
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure() {
        let fx = fixture(StageTimeouts {
            download: Duration::from_millis(20),
            processing: Duration::from_millis(20),
        });
        fx.harness.script(Stage::Download, Step::Hang);
        let job = processing_job(&fx.store).await;

        let recorded = fx
            .runner
            .run(&job, Stage::Download, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(recorded.attempt.outcome, AttemptOutcome::Failed);
        assert!(recorded.attempt.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancellation_records_cancelled_attempt() {
        let fx = fixture(StageTimeouts::default());
        fx.harness.script(Stage::Download, Step::Hang);
        let job = processing_job(&fx.store).await;
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let recorded = fx.runner.run(&job, Stage::Download, &cancel).await.unwrap();
        assert_eq!(recorded.attempt.outcome, AttemptOutcome::Cancelled);
        assert_eq!(recorded.attempt.error, None);
    }

    #[tokio::test]
    async fn test_out_of_order_stage_rejected() {
        let fx = fixture(StageTimeouts::default());
        let job = processing_job(&fx.store).await;

        let err = fx
            .runner
            .run(&job, Stage::Mix, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidState(_)));
        assert!(fx.harness.stages_called(job.id).is_empty());
        assert!(fx.store.get(job.id).await.unwrap().history.is_empty());
    }

    #[tokio::test]
    async fn test_queued_job_rejected() {
        let fx = fixture(StageTimeouts::default());
        let job = fx
            .store
            .create("https://cdn.example.com/a.mp4".into(), "track-a".into())
            .await;

        let err = fx
            .runner
            .run(&job, Stage::Download, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_stale_snapshot_not_recorded() {
        let fx = fixture(StageTimeouts::default());
        let job = processing_job(&fx.store).await;
        fx.runner
            .run(&job, Stage::Download, &CancellationToken::new())
            .await
            .unwrap();

        let err = fx
            .runner
            .run(&job, Stage::Download, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::StaleWrite { .. }));
        assert_eq!(fx.store.get(job.id).await.unwrap().history.len(), 1);
    }
}
