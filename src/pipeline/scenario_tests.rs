//! End-to-end pipeline scenarios driven with a fake clock

use super::*;
use crate::clock::FakeClock;
use crate::jobs::{AttemptOutcome, HistoryEntry};
use crate::pipeline::collaborators::fakes::{FakeResolver, Harness, Step};
use pretty_assertions::assert_eq;

struct World {
    clock: FakeClock,
    harness: Harness,
    pipeline: Pipeline,
}

fn config() -> PipelineConfig {
    PipelineConfig {
        scheduler: SchedulerConfig::default(),
        timeouts: StageTimeouts::default(),
        archive_ttl: chrono::Duration::hours(24),
        sweep_interval: Duration::from_secs(60),
        links: ArtifactLinks::new("scenario-secret", "http://reels.test", chrono::Duration::minutes(15)),
    }
}

fn world_with(harness: Harness) -> World {
    let clock = FakeClock::new();
    let pipeline = Pipeline::new(
        harness.collaborators.clone(),
        config(),
        Arc::new(clock.clone()),
    );
    World {
        clock,
        harness,
        pipeline,
    }
}

fn world() -> World {
    world_with(Harness::new())
}

async fn submit(world: &World) -> Job {
    world
        .pipeline
        .submit(
            "https://videos.example.com/reel.mp4".to_string(),
            "summer_vibes".to_string(),
        )
        .await
        .unwrap()
}

/// Run rounds, advancing past any backoff, until nothing is left to do
async fn drain(world: &World) {
    for _ in 0..32 {
        let reports = world.pipeline.scheduler().run_once().await;
        if reports.is_empty() {
            if world.pipeline.scheduler().load().queued == 0 {
                return;
            }
            world.clock.advance(chrono::Duration::minutes(10));
        }
    }
}

#[tokio::test]
async fn test_full_scenario() {
    let world = world();

    // submit: queued with empty history
    let job = submit(&world).await;
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.history.is_empty());

    // one round: processing with a single Download attempt
    world.pipeline.scheduler().run_once().await;
    let job = world.pipeline.status(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    let stages: Vec<_> = job.attempts().map(|a| a.stage).collect();
    assert_eq!(stages, vec![Stage::Download]);

    // three consecutive Analysis failures: failed, no Mix attempted
    for _ in 0..3 {
        world.harness.script(Stage::Analysis, Step::Fail("scene detector crashed"));
    }
    drain(&world).await;
    let failed = world.pipeline.status(job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    let analysis: Vec<_> = failed
        .attempts()
        .filter(|a| a.stage == Stage::Analysis)
        .map(|a| a.outcome)
        .collect();
    assert_eq!(analysis, vec![AttemptOutcome::Failed; 3]);
    assert!(failed.attempts().all(|a| a.stage != Stage::Mix));
    assert_eq!(
        failed.failure(),
        Some(JobError::RetriesExhausted {
            stage: Stage::Analysis,
            attempts: 3
        })
    );

    // a manual run on the failed job is rejected
    let err = world
        .pipeline
        .run_stage(job.id, Stage::Analysis)
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::InvalidState(_)));

    // deliver another job, then pass the delivery TTL
    let job = submit(&world).await;
    drain(&world).await;
    let delivered = world.pipeline.status(job.id).await.unwrap();
    assert_eq!(delivered.status, JobStatus::Delivered);
    assert!(world.pipeline.artifact_link(job.id).await.is_ok());

    world.clock.advance(chrono::Duration::hours(6));
    let err = world.pipeline.artifact_link(job.id).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Job(JobError::Expired(_))));
}

#[tokio::test]
async fn test_stage_order_holds_under_retries() {
    let world = world();
    world.harness.script(Stage::Download, Step::Fail("timeout"));
    world.harness.script(Stage::Mix, Step::Fail("clipping"));
    world.harness.script(Stage::Mix, Step::Fail("clipping"));

    let job = submit(&world).await;
    drain(&world).await;

    let job = world.pipeline.status(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Delivered);

    // every attempt of stage N+1 is preceded by a success of stage N
    let mut succeeded = Vec::new();
    for attempt in job.attempts() {
        if let Some(previous) = attempt.stage.previous() {
            assert!(
                succeeded.contains(&previous),
                "{} attempted before {} succeeded",
                attempt.stage,
                previous
            );
        }
        if attempt.is_success() {
            succeeded.push(attempt.stage);
        }
    }
    assert_eq!(
        world.harness.stages_called(job.id),
        vec![
            Stage::Download,
            Stage::Download,
            Stage::Analysis,
            Stage::Mix,
            Stage::Mix,
            Stage::Mix,
            Stage::Render
        ]
    );
}

#[tokio::test]
async fn test_delivery_expiry_is_exact() {
    let world = world();
    let job = submit(&world).await;
    drain(&world).await;

    let job = world.pipeline.status(job.id).await.unwrap();
    assert!(job.artifact_ref.is_some());
    assert_eq!(
        job.expires_at.unwrap(),
        job.delivered_at.unwrap() + chrono::Duration::hours(6)
    );
    assert_eq!(job.progress(), 100);
}

#[tokio::test]
async fn test_revision_round_trip() {
    let world = world();
    let job = submit(&world).await;
    drain(&world).await;
    let first_artifact = world
        .pipeline
        .status(job.id)
        .await
        .unwrap()
        .artifact_ref
        .unwrap();

    world.pipeline.begin_review(job.id).await.unwrap();
    let revised = world
        .pipeline
        .submit_feedback(
            job.id,
            FeedbackOutcome::ReviseRequested {
                note: "cut on the beat".into(),
                reentry_stage: Stage::Analysis,
            },
        )
        .await
        .unwrap();
    assert_eq!(revised.current_stage, Stage::Analysis);
    assert_eq!(revised.artifact_ref, None);
    assert_eq!(world.harness.artifacts.revocations(job.id), vec![first_artifact]);

    drain(&world).await;
    let redelivered = world.pipeline.status(job.id).await.unwrap();
    assert_eq!(redelivered.status, JobStatus::Delivered);
    let revisions = redelivered
        .history
        .iter()
        .filter(|entry| matches!(entry, HistoryEntry::Revision(_)))
        .count();
    assert_eq!(revisions, 1);

    let archived = world
        .pipeline
        .submit_feedback(job.id, FeedbackOutcome::Approved)
        .await
        .unwrap();
    assert_eq!(archived.status, JobStatus::Archived);
    let err = world.pipeline.artifact_link(job.id).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Job(JobError::Expired(_))));
}

#[tokio::test]
async fn test_revoked_artifact_link_refused() {
    let world = world();
    let job = submit(&world).await;
    drain(&world).await;

    let link = world.pipeline.artifact_link(job.id).await.unwrap();
    let resolved = world.pipeline.resolve_link(&link.token).await.unwrap();
    world
        .harness
        .artifacts
        .revoke(job.id, &resolved.artifact_ref)
        .await;

    let err = world.pipeline.resolve_link(&link.token).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Job(JobError::Expired(_))));
}

#[tokio::test]
async fn test_rerender_after_revision_gets_fresh_artifact() {
    let clock = FakeClock::new();
    let pipeline = Pipeline::new(
        crate::pipeline::local::local_collaborators(
            std::path::PathBuf::from("/tmp/reel"),
            None,
            Duration::ZERO,
        ),
        config(),
        Arc::new(clock.clone()),
    );
    let scheduler = pipeline.scheduler();
    let job = pipeline
        .submit(
            "https://videos.example.com/reel.mp4".to_string(),
            "summer_vibes".to_string(),
        )
        .await
        .unwrap();
    while scheduler.load().queued > 0 {
        scheduler.run_once().await;
    }
    let first = pipeline.status(job.id).await.unwrap().artifact_ref.unwrap();
    let old_link = pipeline.artifact_link(job.id).await.unwrap();

    pipeline
        .submit_feedback(
            job.id,
            FeedbackOutcome::ReviseRequested {
                note: "warmer grade".into(),
                reentry_stage: Stage::Render,
            },
        )
        .await
        .unwrap();
    let err = pipeline.artifact_link(job.id).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Job(JobError::Expired(_))));

    while scheduler.load().queued > 0 {
        scheduler.run_once().await;
    }
    let redelivered = pipeline.status(job.id).await.unwrap();
    assert_eq!(redelivered.status, JobStatus::Delivered);
    assert_ne!(redelivered.artifact_ref.as_deref(), Some(first.as_str()));

    let err = pipeline.resolve_link(&old_link.token).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Job(JobError::Expired(_))));
    let new_link = pipeline.artifact_link(job.id).await.unwrap();
    assert!(pipeline.resolve_link(&new_link.token).await.is_ok());
}

#[tokio::test]
async fn test_unresolvable_reference_rejected() {
    let mut resolver = FakeResolver::default();
    resolver.unknown.insert("missing_track".to_string());
    let world = world_with(Harness::with_resolver(resolver));

    let err = world
        .pipeline
        .submit(
            "https://videos.example.com/reel.mp4".to_string(),
            "missing_track".to_string(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::InvalidReference(_)));
    assert_eq!(world.pipeline.store().count().await, 0);
}

#[tokio::test]
async fn test_retention_lifecycle() {
    let world = world();
    let job = submit(&world).await;
    drain(&world).await;

    world.clock.advance(chrono::Duration::hours(6));
    let report = world.pipeline.retention().sweep().await;
    assert_eq!(report.expired, 1);
    assert_eq!(
        world.pipeline.status(job.id).await.unwrap().status,
        JobStatus::Archived
    );

    world.clock.advance(chrono::Duration::hours(24));
    let report = world.pipeline.retention().sweep().await;
    assert_eq!(report.purged, 1);
    assert!(matches!(
        world.pipeline.status(job.id).await,
        Err(JobError::NotFound(_))
    ));
}
