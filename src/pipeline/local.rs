//! Local collaborators
//!
//! Stand-in implementations that back the binary when no external media
//! services are wired in. Stage processors simulate work and hand back
//! file-style references under a working directory.

use crate::error::JobError;
use crate::jobs::{JobId, Stage};
use crate::pipeline::collaborators::{
    ArtifactStore, Collaborators, ProcessorError, ReferenceResolver, StageInput, StageProcessor,
};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

static TRACK_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("track id pattern is valid"));

/// Simulated media processor for one stage
pub struct LocalProcessor {
    stage: Stage,
    work_dir: PathBuf,
    latency: Duration,
}

impl LocalProcessor {
    pub fn new(stage: Stage, work_dir: PathBuf, latency: Duration) -> Self {
        Self {
            stage,
            work_dir,
            latency,
        }
    }

    fn output_name(&self, input: &StageInput) -> String {
        match self.stage {
            Stage::Download => format!("videos/{}.mp4", input.job_id),
            Stage::Analysis => format!("analysis/{}.json", input.job_id),
            Stage::Mix => format!("mix/{}-{}.wav", input.job_id, input.music_ref),
            Stage::Render => format!(
                "processed/{}-r{}-a{}.mp4",
                input.job_id, input.revision, input.attempt
            ),
        }
    }
}

#[async_trait]
impl StageProcessor for LocalProcessor {
    async fn process(&self, input: &StageInput) -> Result<String, ProcessorError> {
        if self.stage != Stage::Download && input.upstream.is_none() {
            return Err(ProcessorError::Failed(format!(
                "{} has no upstream output to work from",
                self.stage
            )));
        }

        debug!(
            job_id = %input.job_id,
            stage = %self.stage,
            attempt = input.attempt,
            "Simulating stage work"
        );
        tokio::time::sleep(self.latency).await;

        let output = self.work_dir.join(self.output_name(input));
        Ok(output.to_string_lossy().into_owned())
    }
}

/// Validates source URLs syntactically and music ids against an optional catalog
pub struct LocalResolver {
    /// Directory holding `<track id>.mp3` files; any well-formed id is accepted when unset
    music_dir: Option<PathBuf>,
}

impl LocalResolver {
    pub fn new(music_dir: Option<PathBuf>) -> Self {
        Self { music_dir }
    }
}

#[async_trait]
impl ReferenceResolver for LocalResolver {
    async fn resolve_source(&self, source_ref: &str) -> Result<(), JobError> {
        let url = Url::parse(source_ref)
            .map_err(|e| JobError::InvalidReference(format!("source '{}': {}", source_ref, e)))?;
        match url.scheme() {
            "http" | "https" if url.host().is_some() => Ok(()),
            scheme => Err(JobError::InvalidReference(format!(
                "source '{}': unsupported scheme '{}'",
                source_ref, scheme
            ))),
        }
    }

    async fn resolve_music(&self, music_ref: &str) -> Result<(), JobError> {
        if !TRACK_ID.is_match(music_ref) {
            return Err(JobError::InvalidReference(format!(
                "music track '{}' is not a valid track id",
                music_ref
            )));
        }
        if let Some(dir) = &self.music_dir {
            let path = dir.join(format!("{}.mp3", music_ref));
            let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
            if !exists {
                return Err(JobError::InvalidReference(format!(
                    "music track '{}' not found",
                    music_ref
                )));
            }
        }
        Ok(())
    }
}

/// Tracks revoked artifacts in memory
#[derive(Default)]
pub struct LocalArtifactStore {
    revoked: Mutex<HashSet<String>>,
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn revoke(&self, job_id: JobId, artifact_ref: &str) {
        let newly = match self.revoked.lock() {
            Ok(mut revoked) => revoked.insert(artifact_ref.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(artifact_ref.to_string()),
        };
        if newly {
            info!(job_id = %job_id, artifact = %artifact_ref, "Artifact revoked");
        }
    }

    async fn is_revoked(&self, artifact_ref: &str) -> bool {
        match self.revoked.lock() {
            Ok(revoked) => revoked.contains(artifact_ref),
            Err(poisoned) => poisoned.into_inner().contains(artifact_ref),
        }
    }
}

/// Wire every collaborator with its local implementation
pub fn local_collaborators(
    work_dir: PathBuf,
    music_dir: Option<PathBuf>,
    latency: Duration,
) -> Collaborators {
    let processor = |stage| -> Arc<dyn StageProcessor> {
        Arc::new(LocalProcessor::new(stage, work_dir.clone(), latency))
    };
    Collaborators {
        download: processor(Stage::Download),
        analysis: processor(Stage::Analysis),
        mix: processor(Stage::Mix),
        render: processor(Stage::Render),
        resolver: Arc::new(LocalResolver::new(music_dir)),
        artifacts: Arc::new(LocalArtifactStore::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn input(stage: Stage, upstream: Option<&str>) -> StageInput {
        StageInput {
            job_id: Uuid::new_v4(),
            stage,
            attempt: 1,
            revision: 0,
            source_ref: "https://cdn.example.com/a.mp4".into(),
            music_ref: "lofi_01".into(),
            upstream: upstream.map(str::to_string),
            revision_note: None,
        }
    }

    #[tokio::test]
    async fn test_resolver_accepts_http_sources() {
        let resolver = LocalResolver::new(None);
        assert!(resolver.resolve_source("https://cdn.example.com/a.mp4").await.is_ok());
        assert!(matches!(
            resolver.resolve_source("ftp://cdn.example.com/a.mp4").await,
            Err(JobError::InvalidReference(_))
        ));
        assert!(matches!(
            resolver.resolve_source("not a url").await,
            Err(JobError::InvalidReference(_))
        ));
    }

    #[tokio::test]
    async fn test_resolver_checks_track_ids() {
        let resolver = LocalResolver::new(None);
        assert!(resolver.resolve_music("lofi_01").await.is_ok());
        assert!(resolver.resolve_music("../etc/passwd").await.is_err());
        assert!(resolver.resolve_music("").await.is_err());
    }

    #[tokio::test]
    async fn test_resolver_uses_catalog_dir() {
        let resolver = LocalResolver::new(Some(std::env::temp_dir().join("reel-no-such-catalog")));
        assert!(matches!(
            resolver.resolve_music("lofi_01").await,
            Err(JobError::InvalidReference(_))
        ));
    }

    #[tokio::test]
    async fn test_processor_requires_upstream_after_download() {
        let processor = LocalProcessor::new(Stage::Mix, PathBuf::from("/tmp/reel"), Duration::ZERO);
        assert!(processor.process(&input(Stage::Mix, None)).await.is_err());

        let out = processor
            .process(&input(Stage::Mix, Some("/tmp/reel/analysis/x.json")))
            .await
            .unwrap();
        assert!(out.starts_with("/tmp/reel/mix/"));
    }

    #[tokio::test]
    async fn test_artifact_store_revocation_is_idempotent() {
        let store = LocalArtifactStore::default();
        let id = Uuid::new_v4();
        store.revoke(id, "/tmp/reel/processed/x.mp4").await;
        store.revoke(id, "/tmp/reel/processed/x.mp4").await;
        assert!(store.is_revoked("/tmp/reel/processed/x.mp4").await);
        assert!(!store.is_revoked("/tmp/reel/processed/y.mp4").await);
    }

    #[tokio::test]
    async fn test_render_output_is_unique_per_revision() {
        let processor = LocalProcessor::new(Stage::Render, PathBuf::from("/tmp/reel"), Duration::ZERO);
        let first = input(Stage::Render, Some("/tmp/reel/mix/x.wav"));
        let mut revised = first.clone();
        revised.revision = 1;

        let before = processor.process(&first).await.unwrap();
        let after = processor.process(&revised).await.unwrap();
        assert_ne!(before, after);
        assert!(after.ends_with("-r1-a1.mp4"));
    }
}
