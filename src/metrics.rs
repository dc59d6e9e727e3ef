//! Prometheus metrics for the pipeline.

use crate::jobs::{AttemptOutcome, JobStatus, Stage};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder.
/// Returns a handle used by the `/metrics` endpoint to render.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Metric names as constants for consistency.
pub mod names {
    // Job lifecycle
    pub const JOBS_TOTAL: &str = "reel_jobs_total";
    pub const QUEUE_LENGTH: &str = "reel_queue_length";
    pub const ACTIVE_STAGES: &str = "reel_active_stages";

    // Stage execution
    pub const STAGE_ATTEMPTS_TOTAL: &str = "reel_stage_attempts_total";
    pub const STAGE_DURATION_SECONDS: &str = "reel_stage_duration_seconds";

    // Retention
    pub const ARTIFACTS_EXPIRED_TOTAL: &str = "reel_artifacts_expired_total";
    pub const JOBS_PURGED_TOTAL: &str = "reel_jobs_purged_total";

    // Rate limiting
    pub const RATE_LIMIT_HITS_TOTAL: &str = "reel_rate_limit_hits_total";
}

/// Record a job entering `status`.
pub fn record_job_status(status: JobStatus) {
    counter!(names::JOBS_TOTAL, "status" => status.as_str()).increment(1);
}

/// Record one finished stage attempt.
pub fn record_stage_attempt(stage: Stage, outcome: AttemptOutcome, duration_secs: f64) {
    let labels = [
        ("stage", stage.as_str().to_string()),
        ("outcome", outcome.as_str().to_string()),
    ];
    counter!(names::STAGE_ATTEMPTS_TOTAL, &labels).increment(1);
    histogram!(names::STAGE_DURATION_SECONDS, "stage" => stage.as_str()).record(duration_secs);
}

/// Update scheduler occupancy gauges.
pub fn set_scheduler_load(queued: usize, active: usize) {
    gauge!(names::QUEUE_LENGTH).set(queued as f64);
    gauge!(names::ACTIVE_STAGES).set(active as f64);
}

pub fn record_artifact_expired() {
    counter!(names::ARTIFACTS_EXPIRED_TOTAL).increment(1);
}

pub fn record_jobs_purged(count: u64) {
    counter!(names::JOBS_PURGED_TOTAL).increment(count);
}

pub fn record_rate_limit_hit(endpoint: &'static str) {
    counter!(names::RATE_LIMIT_HITS_TOTAL, "endpoint" => endpoint).increment(1);
}
