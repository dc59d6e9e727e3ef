//! Pipeline Scheduler
//!
//! Decides which `(job, stage)` unit runs next. Units wait in a ready queue
//! ordered by job creation time; workers claim them subject to a global cap
//! and a render cap, run them through the [`StageRunner`] and settle the
//! outcome (advance, retry with backoff, deliver, fail or cancel).
//!
//! Every follow-up decision is derived from the job as stored, so the same
//! logic serves fresh outcomes, lost concurrent writes and reconciliation.

use crate::clock::SharedClock;
use crate::error::JobError;
use crate::jobs::{
    AttemptOutcome, HistoryEntry, Job, JobFilter, JobId, JobStatus, JobStore, Stage,
    TransitionOptions,
};
use crate::metrics;
use crate::pipeline::queue::{ReadyQueue, WorkUnit};
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::runner::StageRunner;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Dispatch loop poll interval when nothing is scheduled to wake it
const IDLE_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Stages in flight across all jobs
    pub max_concurrent_stages: usize,
    /// Render stages in flight
    pub max_concurrent_renders: usize,
    pub retry: RetryPolicy,
    /// Lifetime of a delivered artifact
    pub delivery_ttl: chrono::Duration,
    /// How often the dispatch loop re-checks for orphaned jobs
    pub reconcile_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_stages: 4,
            max_concurrent_renders: 1,
            retry: RetryPolicy::default(),
            delivery_ttl: chrono::Duration::hours(6),
            reconcile_interval: Duration::from_secs(30),
        }
    }
}

/// What happened to a unit of work (or to a job handed to the scheduler)
#[derive(Debug, Clone, PartialEq)]
pub enum UnitReport {
    /// Next stage queued
    Advanced { job_id: JobId, next: Stage },
    /// Stage failed, queued again after backoff
    Retrying {
        job_id: JobId,
        error: JobError,
        retry_at: DateTime<Utc>,
    },
    Delivered { job_id: JobId, artifact_ref: String },
    /// Retries exhausted, job is terminal
    Failed { job_id: JobId, error: JobError },
    Cancelled { job_id: JobId },
    /// Nothing left to do for this job
    Discarded { job_id: JobId, reason: String },
}

impl UnitReport {
    pub fn job_id(&self) -> JobId {
        match self {
            UnitReport::Advanced { job_id, .. }
            | UnitReport::Retrying { job_id, .. }
            | UnitReport::Delivered { job_id, .. }
            | UnitReport::Failed { job_id, .. }
            | UnitReport::Cancelled { job_id }
            | UnitReport::Discarded { job_id, .. } => *job_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UnitReport::Advanced { .. } => "advanced",
            UnitReport::Retrying { .. } => "retrying",
            UnitReport::Delivered { .. } => "delivered",
            UnitReport::Failed { .. } => "failed",
            UnitReport::Cancelled { .. } => "cancelled",
            UnitReport::Discarded { .. } => "discarded",
        }
    }
}

/// Scheduler occupancy
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerLoad {
    pub queued: usize,
    pub active: usize,
    pub active_renders: usize,
}

struct ActiveUnit {
    stage: Stage,
    cancel: CancellationToken,
    /// Flips to `true` once the unit has been settled
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct SchedulerState {
    queue: ReadyQueue,
    active: HashMap<JobId, ActiveUnit>,
}

impl SchedulerState {
    fn load(&self) -> SchedulerLoad {
        SchedulerLoad {
            queued: self.queue.len(),
            active: self.active.len(),
            active_renders: self.active_renders(),
        }
    }

    fn active_renders(&self) -> usize {
        self.active
            .values()
            .filter(|unit| unit.stage == Stage::Render)
            .count()
    }
}

fn lock_state(state: &Mutex<SchedulerState>) -> MutexGuard<'_, SchedulerState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Releases a worker slot when the unit is settled (or its task unwinds)
struct ActiveGuard {
    state: Arc<Mutex<SchedulerState>>,
    notify: Arc<Notify>,
    job_id: JobId,
    done: watch::Sender<bool>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let load = {
            let mut state = lock_state(&self.state);
            state.active.remove(&self.job_id);
            state.load()
        };
        self.done.send_replace(true);
        metrics::set_scheduler_load(load.queued, load.active);
        self.notify.notify_one();
    }
}

/// A unit taken off the queue together with its slot
struct Claimed {
    unit: WorkUnit,
    cancel: CancellationToken,
    guard: ActiveGuard,
}

pub struct Scheduler {
    store: Arc<JobStore>,
    runner: StageRunner,
    config: SchedulerConfig,
    clock: SharedClock,
    state: Arc<Mutex<SchedulerState>>,
    notify: Arc<Notify>,
}

impl Scheduler {
    pub fn new(
        store: Arc<JobStore>,
        runner: StageRunner,
        config: SchedulerConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            runner,
            config,
            clock,
            state: Arc::new(Mutex::new(SchedulerState::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn load(&self) -> SchedulerLoad {
        lock_state(&self.state).load()
    }

    /// Hand a job to the scheduler; its pending stage is queued.
    ///
    /// Used for new submissions and for revision re-entry.
    pub async fn enqueue(&self, job: &Job) -> Result<UnitReport, JobError> {
        self.advance(job.clone()).await
    }

    fn push_unit(&self, unit: WorkUnit) {
        let load = {
            let mut state = lock_state(&self.state);
            state.queue.push(unit);
            state.load()
        };
        metrics::set_scheduler_load(load.queued, load.active);
        debug!(job_id = %unit.job_id, stage = %unit.stage, "Unit queued");
        self.notify.notify_one();
    }

    /// Take the first eligible unit, honouring both concurrency caps
    fn claim(&self) -> Option<Claimed> {
        let now = self.clock.now();
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;

        if state.active.len() >= self.config.max_concurrent_stages {
            return None;
        }
        let renders_full = state.active_renders() >= self.config.max_concurrent_renders;

        let active = &state.active;
        let unit = state.queue.pop_eligible(now, |unit| {
            !active.contains_key(&unit.job_id) && !(unit.stage == Stage::Render && renders_full)
        })?;

        Some(self.occupy(state, unit))
    }

    fn occupy(&self, state: &mut SchedulerState, unit: WorkUnit) -> Claimed {
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        state.active.insert(
            unit.job_id,
            ActiveUnit {
                stage: unit.stage,
                cancel: cancel.clone(),
                done: done_rx,
            },
        );
        let load = state.load();
        metrics::set_scheduler_load(load.queued, load.active);

        Claimed {
            unit,
            cancel,
            guard: ActiveGuard {
                state: self.state.clone(),
                notify: self.notify.clone(),
                job_id: unit.job_id,
                done: done_tx,
            },
        }
    }

    /// Claim every currently eligible unit and run them all to completion
    pub async fn run_once(self: &Arc<Self>) -> Vec<UnitReport> {
        let mut workers = JoinSet::new();
        while let Some(claimed) = self.claim() {
            self.spawn_worker(&mut workers, claimed);
        }

        let mut reports = Vec::with_capacity(workers.len());
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!("Stage worker panicked: {}", e),
            }
        }
        reports
    }

    fn spawn_worker(self: &Arc<Self>, workers: &mut JoinSet<UnitReport>, claimed: Claimed) {
        let scheduler = Arc::clone(self);
        workers.spawn(async move {
            let Claimed {
                unit,
                cancel,
                guard,
            } = claimed;
            let report = scheduler.execute(unit, &cancel).await;
            drop(guard);
            report
        });
    }

    /// Long-running dispatch loop
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            max_concurrent_stages = self.config.max_concurrent_stages,
            max_concurrent_renders = self.config.max_concurrent_renders,
            "Scheduler started"
        );

        let mut workers: JoinSet<UnitReport> = JoinSet::new();
        let mut reconcile = tokio::time::interval(self.config.reconcile_interval);
        reconcile.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            while let Some(claimed) = self.claim() {
                self.spawn_worker(&mut workers, claimed);
            }

            let wake = self.next_wakeup();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.notify.notified() => {}
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        error!("Stage worker panicked: {}", e);
                    }
                }
                _ = tokio::time::sleep(wake) => {}
                _ = reconcile.tick() => {
                    let requeued = self.reconcile().await;
                    if requeued > 0 {
                        info!(requeued, "Reconciled orphaned jobs");
                    }
                }
            }
        }

        info!(in_flight = workers.len(), "Scheduler stopping, draining in-flight stages");
        while workers.join_next().await.is_some() {}
        info!("Scheduler stopped");
    }

    fn next_wakeup(&self) -> Duration {
        let now = self.clock.now();
        lock_state(&self.state)
            .queue
            .next_wakeup()
            .filter(|at| *at > now)
            .and_then(|at| (at - now).to_std().ok())
            .map_or(IDLE_POLL, |delay| delay.min(IDLE_POLL))
    }

    /// Run a claimed unit and settle its outcome. Never fails: problems are
    /// reported and the job is re-planned from its stored state.
    async fn execute(&self, unit: WorkUnit, cancel: &CancellationToken) -> UnitReport {
        match self.process(unit, cancel).await {
            Ok(report) => report,
            Err(e @ (JobError::StaleWrite { .. } | JobError::InvalidState(_))) => {
                debug!(job_id = %unit.job_id, stage = %unit.stage, error = %e, "Re-reading job after conflict");
                self.recover(unit.job_id).await
            }
            Err(e) => {
                warn!(job_id = %unit.job_id, stage = %unit.stage, error = %e, "Discarding unit");
                UnitReport::Discarded {
                    job_id: unit.job_id,
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn process(
        &self,
        unit: WorkUnit,
        cancel: &CancellationToken,
    ) -> Result<UnitReport, JobError> {
        let mut job = self.store.get(unit.job_id).await?;
        if job.status == JobStatus::Queued {
            job = self
                .store
                .transition(job.id, JobStatus::Processing, TransitionOptions::at_version(job.version))
                .await?;
            metrics::record_job_status(JobStatus::Processing);
        }

        let recorded = self.runner.run(&job, unit.stage, cancel).await?;
        self.advance(recorded.job).await
    }

    /// Re-read a job whose last write lost a race and re-plan it
    async fn recover(&self, job_id: JobId) -> UnitReport {
        let outcome = match self.store.get(job_id).await {
            Ok(job) => self.advance(job).await,
            Err(e) => Err(e),
        };
        outcome.unwrap_or_else(|e| {
            warn!(job_id = %job_id, error = %e, "Discarding stale result");
            UnitReport::Discarded {
                job_id,
                reason: e.to_string(),
            }
        })
    }

    /// Decide and apply the next step for `job` from its stored history
    async fn advance(&self, job: Job) -> Result<UnitReport, JobError> {
        if !job.status.is_schedulable() {
            return Ok(UnitReport::Discarded {
                job_id: job.id,
                reason: format!("job is {}", job.status),
            });
        }

        let Some(stage) = job.next_stage() else {
            return self.deliver(job).await;
        };

        let last_attempt = match job.current_run().last() {
            Some(HistoryEntry::Attempt(attempt)) if attempt.stage == stage => Some(attempt),
            _ => None,
        };

        match last_attempt.map(|attempt| attempt.outcome) {
            Some(AttemptOutcome::Cancelled) => {
                let job = self
                    .store
                    .transition(job.id, JobStatus::Cancelled, TransitionOptions::at_version(job.version))
                    .await?;
                metrics::record_job_status(JobStatus::Cancelled);
                info!(job_id = %job.id, stage = %stage, "Job cancelled");
                Ok(UnitReport::Cancelled { job_id: job.id })
            }
            Some(AttemptOutcome::Failed) => {
                let failures = job.consecutive_failures(stage);
                if !self.config.retry.should_retry(failures) {
                    return self.fail(job, stage).await;
                }

                let detail = last_attempt
                    .and_then(|attempt| attempt.error.clone())
                    .unwrap_or_default();
                let delay = self.config.retry.delay_after(failures);
                let retry_at = self.clock.now() + delay;
                self.push_unit(WorkUnit::new(job.id, stage, job.created_at).delayed_until(retry_at));
                info!(
                    job_id = %job.id,
                    stage = %stage,
                    failures,
                    retry_in_secs = delay.num_seconds(),
                    "Stage retry scheduled"
                );
                Ok(UnitReport::Retrying {
                    job_id: job.id,
                    error: JobError::StageFailure { stage, detail },
                    retry_at,
                })
            }
            Some(AttemptOutcome::Success) | None => {
                self.push_unit(WorkUnit::new(job.id, stage, job.created_at));
                Ok(UnitReport::Advanced {
                    job_id: job.id,
                    next: stage,
                })
            }
        }
    }

    async fn deliver(&self, job: Job) -> Result<UnitReport, JobError> {
        let artifact_ref = job
            .stage_output(Stage::Render)
            .map(str::to_string)
            .ok_or_else(|| {
                JobError::InvalidState(format!("job {} finished without a render output", job.id))
            })?;

        let job = self
            .store
            .transition(
                job.id,
                JobStatus::Delivered,
                TransitionOptions::delivery(job.version, artifact_ref.clone(), self.config.delivery_ttl),
            )
            .await?;
        metrics::record_job_status(JobStatus::Delivered);
        info!(
            job_id = %job.id,
            artifact = %artifact_ref,
            expires_at = ?job.expires_at,
            "Job delivered"
        );
        Ok(UnitReport::Delivered {
            job_id: job.id,
            artifact_ref,
        })
    }

    async fn fail(&self, job: Job, stage: Stage) -> Result<UnitReport, JobError> {
        let job = self
            .store
            .transition(job.id, JobStatus::Failed, TransitionOptions::at_version(job.version))
            .await?;
        metrics::record_job_status(JobStatus::Failed);

        let error = job.failure().unwrap_or(JobError::RetriesExhausted {
            stage,
            attempts: self.config.retry.limit,
        });
        warn!(job_id = %job.id, stage = %stage, error = %error, "Job failed");
        Ok(UnitReport::Failed {
            job_id: job.id,
            error,
        })
    }

    /// Re-plan `Queued`/`Processing` jobs that have neither a queued nor a
    /// running unit. Returns how many were handed back to the queue.
    pub async fn reconcile(&self) -> usize {
        let jobs = self
            .store
            .list(&JobFilter {
                statuses: vec![JobStatus::Queued, JobStatus::Processing],
                ..Default::default()
            })
            .await;

        let mut requeued = 0;
        for job in jobs {
            let orphaned = {
                let state = lock_state(&self.state);
                !state.active.contains_key(&job.id) && !state.queue.contains(job.id, job.created_at)
            };
            if !orphaned {
                continue;
            }
            let job_id = job.id;
            match self.advance(job).await {
                Ok(UnitReport::Advanced { .. } | UnitReport::Retrying { .. }) => requeued += 1,
                Ok(_) => {}
                Err(e) => warn!(job_id = %job_id, error = %e, "Reconciliation skipped job"),
            }
        }
        requeued
    }

    /// Cancel a job: stop its in-flight stage (recording a `Cancelled`
    /// attempt) or drop its queued unit, then mark it `Cancelled`.
    pub async fn cancel(&self, id: JobId) -> Result<Job, JobError> {
        loop {
            let job = self.store.get(id).await?;
            if job.status == JobStatus::Cancelled {
                return Ok(job);
            }
            if !job.status.is_schedulable() {
                return Err(JobError::InvalidState(format!(
                    "job {} is {} and can no longer be cancelled",
                    id, job.status
                )));
            }

            let in_flight = {
                let mut state = lock_state(&self.state);
                match state.active.get(&id) {
                    Some(unit) => {
                        unit.cancel.cancel();
                        Some(unit.done.clone())
                    }
                    None => {
                        state.queue.remove(id, job.created_at);
                        None
                    }
                }
            };

            if let Some(mut done) = in_flight {
                info!(job_id = %id, "Cancelling in-flight stage");
                let _ = done.wait_for(|settled| *settled).await;
                continue;
            }

            return match self
                .store
                .transition(id, JobStatus::Cancelled, TransitionOptions::at_version(job.version))
                .await
            {
                Ok(job) => {
                    metrics::record_job_status(JobStatus::Cancelled);
                    info!(job_id = %id, "Job cancelled");
                    Ok(job)
                }
                Err(JobError::StaleWrite { .. }) => continue,
                Err(e) => Err(e),
            };
        }
    }

    /// Run one stage of one job immediately, outside the queue.
    ///
    /// Only the job's pending stage can run, and only while the job is
    /// schedulable; a `Failed` job is rejected.
    pub async fn run_stage(&self, id: JobId, stage: Stage) -> Result<UnitReport, JobError> {
        let job = self.store.get(id).await?;
        if !job.status.is_schedulable() {
            return Err(JobError::InvalidState(format!(
                "job {} is {}, stages can no longer run",
                id, job.status
            )));
        }
        if job.next_stage() != Some(stage) {
            return Err(JobError::InvalidState(format!(
                "job {} cannot run {} now",
                id, stage
            )));
        }

        let claimed = {
            let mut state = lock_state(&self.state);
            if state.active.contains_key(&id) {
                return Err(JobError::InvalidState(format!(
                    "job {} already has a stage running",
                    id
                )));
            }
            if state.active.len() >= self.config.max_concurrent_stages {
                return Err(JobError::InvalidState(format!(
                    "all {} stage slots are busy",
                    self.config.max_concurrent_stages
                )));
            }
            if stage == Stage::Render && state.active_renders() >= self.config.max_concurrent_renders {
                return Err(JobError::InvalidState(format!(
                    "all {} render slots are busy",
                    self.config.max_concurrent_renders
                )));
            }
            state.queue.remove(id, job.created_at);
            self.occupy(&mut state, WorkUnit::new(id, stage, job.created_at))
        };

        info!(job_id = %id, stage = %stage, "Manual stage run");
        let result = self.process(claimed.unit, &claimed.cancel).await;
        if result.is_err() {
            self.recover(id).await;
        }
        drop(claimed);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::pipeline::collaborators::fakes::{Harness, Step};
    use crate::pipeline::runner::StageTimeouts;
    use pretty_assertions::assert_eq;

    struct Fixture {
        store: Arc<JobStore>,
        clock: FakeClock,
        harness: Harness,
        scheduler: Arc<Scheduler>,
    }

    fn fixture(config: SchedulerConfig) -> Fixture {
        let clock = FakeClock::new();
        let shared: SharedClock = Arc::new(clock.clone());
        let store = Arc::new(JobStore::new(shared.clone()));
        let harness = Harness::new();
        let runner = StageRunner::new(
            store.clone(),
            harness.collaborators.clone(),
            StageTimeouts::default(),
            shared.clone(),
        );
        let scheduler = Arc::new(Scheduler::new(store.clone(), runner, config, shared));
        Fixture {
            store,
            clock,
            harness,
            scheduler,
        }
    }

    async fn submit(fx: &Fixture, n: u32) -> Job {
        let job = fx
            .store
            .create(format!("https://cdn.example.com/{}.mp4", n), "track-a".into())
            .await;
        fx.scheduler.enqueue(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_stages_run_in_order_to_delivery() {
        let fx = fixture(SchedulerConfig::default());
        let job = submit(&fx, 1).await;

        for _ in 0..4 {
            fx.scheduler.run_once().await;
        }

        let job = fx.store.get(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Delivered);
        assert_eq!(fx.harness.stages_called(job.id), Stage::ALL.to_vec());
        assert_eq!(job.expires_at, Some(job.delivered_at.unwrap() + chrono::Duration::hours(6)));
        assert!(job.artifact_ref.is_some());
    }

    #[tokio::test]
    async fn test_render_cap_skips_without_blocking() {
        let fx = fixture(SchedulerConfig {
            max_concurrent_renders: 0,
            ..Default::default()
        });
        let job = submit(&fx, 1).await;
        for _ in 0..3 {
            fx.scheduler.run_once().await;
        }
        let blocked = fx.store.get(job.id).await.unwrap();
        assert_eq!(blocked.next_stage(), Some(Stage::Render));

        let other = submit(&fx, 2).await;
        let reports = fx.scheduler.run_once().await;
        assert_eq!(
            reports,
            vec![UnitReport::Advanced {
                job_id: other.id,
                next: Stage::Analysis
            }]
        );
        assert_eq!(fx.scheduler.load().queued, 2);
    }

    #[tokio::test]
    async fn test_global_cap_limits_round() {
        let fx = fixture(SchedulerConfig {
            max_concurrent_stages: 2,
            ..Default::default()
        });
        for n in 0..3 {
            submit(&fx, n).await;
        }
        let reports = fx.scheduler.run_once().await;
        assert_eq!(reports.len(), 2);
    }

    #[tokio::test]
    async fn test_fifo_by_creation() {
        let fx = fixture(SchedulerConfig {
            max_concurrent_stages: 1,
            ..Default::default()
        });
        let first = submit(&fx, 1).await;
        fx.clock.advance(chrono::Duration::seconds(1));
        let second = submit(&fx, 2).await;

        let reports = fx.scheduler.run_once().await;
        assert_eq!(
            reports,
            vec![UnitReport::Advanced {
                job_id: first.id,
                next: Stage::Analysis
            }]
        );
        // first job's Analysis (older) runs before second's Download
        let reports = fx.scheduler.run_once().await;
        assert_eq!(
            reports,
            vec![UnitReport::Advanced {
                job_id: first.id,
                next: Stage::Mix
            }]
        );
        assert!(fx.harness.stages_called(second.id).is_empty());
    }

    #[tokio::test]
    async fn test_failure_backs_off_then_retries() {
        let fx = fixture(SchedulerConfig::default());
        fx.harness.script(Stage::Download, Step::Fail("connection reset"));
        let job = submit(&fx, 1).await;

        let reports = fx.scheduler.run_once().await;
        assert!(matches!(
            &reports[..],
            [UnitReport::Retrying { error: JobError::StageFailure { stage: Stage::Download, .. }, .. }]
        ));

        // still backing off
        assert!(fx.scheduler.run_once().await.is_empty());

        fx.clock.advance(chrono::Duration::seconds(2));
        let reports = fx.scheduler.run_once().await;
        assert_eq!(
            reports,
            vec![UnitReport::Advanced {
                job_id: job.id,
                next: Stage::Analysis
            }]
        );
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_job() {
        let fx = fixture(SchedulerConfig::default());
        for _ in 0..3 {
            fx.harness.script(Stage::Download, Step::Fail("404"));
        }
        let job = submit(&fx, 1).await;

        let mut last = Vec::new();
        for _ in 0..3 {
            last = fx.scheduler.run_once().await;
            fx.clock.advance(chrono::Duration::minutes(10));
        }

        assert_eq!(
            last,
            vec![UnitReport::Failed {
                job_id: job.id,
                error: JobError::RetriesExhausted {
                    stage: Stage::Download,
                    attempts: 3
                }
            }]
        );
        assert!(fx.scheduler.run_once().await.is_empty());
        assert_eq!(fx.scheduler.load().queued, 0);

        let err = fx.scheduler.run_stage(job.id, Stage::Download).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let fx = fixture(SchedulerConfig::default());
        let job = submit(&fx, 1).await;

        let cancelled = fx.scheduler.cancel(job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(fx.scheduler.run_once().await.is_empty());

        // idempotent
        assert!(fx.scheduler.cancel(job.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_in_flight_stage() {
        let fx = fixture(SchedulerConfig::default());
        fx.harness.script(Stage::Download, Step::Hang);
        let job = submit(&fx, 1).await;

        let scheduler = fx.scheduler.clone();
        let round = tokio::spawn(async move { scheduler.run_once().await });
        while fx.scheduler.load().active == 0 {
            tokio::task::yield_now().await;
        }

        let cancelled = fx.scheduler.cancel(job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(
            round.await.unwrap(),
            vec![UnitReport::Cancelled { job_id: job.id }]
        );
        assert_eq!(fx.scheduler.load().active, 0);

        let attempts: Vec<_> = cancelled.attempts().map(|a| a.outcome).collect();
        assert_eq!(attempts, vec![AttemptOutcome::Cancelled]);
    }

    #[tokio::test]
    async fn test_cancel_delivered_job_rejected() {
        let fx = fixture(SchedulerConfig::default());
        let job = submit(&fx, 1).await;
        for _ in 0..4 {
            fx.scheduler.run_once().await;
        }
        let err = fx.scheduler.cancel(job.id).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_reconcile_requeues_orphans() {
        let fx = fixture(SchedulerConfig::default());
        let job = fx
            .store
            .create("https://cdn.example.com/x.mp4".into(), "track-a".into())
            .await;

        assert_eq!(fx.scheduler.reconcile().await, 1);
        assert_eq!(fx.scheduler.reconcile().await, 0);

        let reports = fx.scheduler.run_once().await;
        assert_eq!(
            reports,
            vec![UnitReport::Advanced {
                job_id: job.id,
                next: Stage::Analysis
            }]
        );
    }

    #[tokio::test]
    async fn test_manual_run_of_pending_stage() {
        let fx = fixture(SchedulerConfig::default());
        let job = submit(&fx, 1).await;

        let report = fx.scheduler.run_stage(job.id, Stage::Download).await.unwrap();
        assert_eq!(
            report,
            UnitReport::Advanced {
                job_id: job.id,
                next: Stage::Analysis
            }
        );

        let err = fx.scheduler.run_stage(job.id, Stage::Render).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_manual_render_respects_render_cap() {
        let fx = fixture(SchedulerConfig::default());
        fx.harness.script(Stage::Render, Step::Hang);
        let busy = submit(&fx, 1).await;
        for _ in 0..3 {
            fx.scheduler.run_once().await;
        }

        let scheduler = fx.scheduler.clone();
        let round = tokio::spawn(async move { scheduler.run_once().await });
        while fx.scheduler.load().active_renders == 0 {
            tokio::task::yield_now().await;
        }

        let job = submit(&fx, 2).await;
        for stage in [Stage::Download, Stage::Analysis, Stage::Mix] {
            fx.scheduler.run_stage(job.id, stage).await.unwrap();
        }
        let err = fx.scheduler.run_stage(job.id, Stage::Render).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidState(_)));

        let waiting = fx.store.get(job.id).await.unwrap();
        assert_eq!(waiting.status, JobStatus::Processing);
        assert_eq!(waiting.next_stage(), Some(Stage::Render));
        assert_eq!(fx.scheduler.load().active_renders, 1);

        fx.scheduler.cancel(busy.id).await.unwrap();
        round.await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_run_respects_stage_cap() {
        let fx = fixture(SchedulerConfig {
            max_concurrent_stages: 1,
            ..Default::default()
        });
        fx.harness.script(Stage::Download, Step::Hang);
        let busy = submit(&fx, 1).await;

        let scheduler = fx.scheduler.clone();
        let round = tokio::spawn(async move { scheduler.run_once().await });
        while fx.scheduler.load().active == 0 {
            tokio::task::yield_now().await;
        }

        let job = submit(&fx, 2).await;
        let err = fx.scheduler.run_stage(job.id, Stage::Download).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidState(_)));
        assert_eq!(fx.store.get(job.id).await.unwrap().status, JobStatus::Queued);

        fx.scheduler.cancel(busy.id).await.unwrap();
        round.await.unwrap();
    }
}
