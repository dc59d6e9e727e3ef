//! Signed artifact links
//!
//! Artifact retrieval hands out an HMAC-SHA256 signed token instead of the raw
//! artifact reference. A token is bound to one job and one artifact and never
//! outlives the artifact's delivery TTL.

use crate::error::{AppError, JobError};
use crate::jobs::{Job, JobId, JobStatus, JobStore};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error(transparent)]
    Job(#[from] JobError),

    /// Malformed token or bad signature
    #[error("Invalid artifact token")]
    InvalidToken,

    #[error("Signing error: {0}")]
    Signing(String),
}

impl From<DeliveryError> for AppError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::Job(e) => AppError::Job(e),
            DeliveryError::InvalidToken => AppError::Forbidden("Invalid artifact token".to_string()),
            DeliveryError::Signing(msg) => AppError::Internal(msg),
        }
    }
}

/// Token payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactToken {
    /// Job id
    pub jid: Uuid,
    /// Artifact reference the token grants access to
    pub art: String,
    /// Expiry, unix seconds
    pub exp: i64,
}

impl ArtifactToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.exp
    }

    fn encode(&self) -> Result<String, DeliveryError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| DeliveryError::Signing(format!("Failed to serialize token: {}", e)))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    fn decode(encoded: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(encoded).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Sign the token: `<payload>.<signature>`, both base64url
    pub fn sign(&self, secret: &str) -> Result<String, DeliveryError> {
        let payload = self.encode()?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| DeliveryError::Signing(format!("Invalid HMAC key: {}", e)))?;
        mac.update(payload.as_bytes());
        let signature = mac.finalize().into_bytes();
        Ok(format!("{}.{}", payload, URL_SAFE_NO_PAD.encode(signature)))
    }

    /// Check the signature and decode. Expiry is not checked here.
    pub fn verify(signed: &str, secret: &str) -> Result<Self, DeliveryError> {
        let (payload, signature) = signed.split_once('.').ok_or(DeliveryError::InvalidToken)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| DeliveryError::InvalidToken)?;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| DeliveryError::Signing(format!("Invalid HMAC key: {}", e)))?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| DeliveryError::InvalidToken)?;

        Self::decode(payload).ok_or(DeliveryError::InvalidToken)
    }
}

/// A link handed to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactLink {
    pub url: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub expires_in_secs: i64,
}

/// A token resolved back to its artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedArtifact {
    pub job_id: JobId,
    pub artifact_ref: String,
    pub expires_at: DateTime<Utc>,
}

/// Issues and resolves signed artifact links
#[derive(Clone)]
pub struct ArtifactLinks {
    secret: String,
    /// Public base URL the token path is appended to
    base_url: String,
    /// Upper bound on a single link's lifetime
    link_ttl: Duration,
}

impl ArtifactLinks {
    pub fn new(secret: impl Into<String>, base_url: impl Into<String>, link_ttl: Duration) -> Self {
        Self {
            secret: secret.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            link_ttl,
        }
    }

    /// Sign a link for the job's live artifact
    pub fn issue(&self, job: &Job, now: DateTime<Utc>) -> Result<ArtifactLink, DeliveryError> {
        let (artifact_ref, expires_at) = match (&job.artifact_ref, job.expires_at) {
            (Some(artifact_ref), Some(expires_at)) if job.status.holds_artifact() => {
                (artifact_ref, expires_at)
            }
            _ if job.delivered_at.is_some()
                || job.status == JobStatus::Archived
                || job.revisions() > 0 =>
            {
                return Err(JobError::Expired(format!(
                    "artifact for job {} is no longer available",
                    job.id
                ))
                .into());
            }
            _ => {
                return Err(JobError::InvalidState(format!(
                    "job {} is {} and has no delivered artifact",
                    job.id, job.status
                ))
                .into());
            }
        };

        if now >= expires_at {
            return Err(JobError::Expired(format!(
                "artifact for job {} expired at {}",
                job.id,
                expires_at.to_rfc3339()
            ))
            .into());
        }

        let link_expires_at = (now + self.link_ttl).min(expires_at);
        let token = ArtifactToken {
            jid: job.id,
            art: artifact_ref.clone(),
            exp: link_expires_at.timestamp(),
        }
        .sign(&self.secret)?;

        Ok(ArtifactLink {
            url: format!("{}/api/artifacts/{}", self.base_url, token),
            token,
            expires_at: link_expires_at,
            expires_in_secs: (link_expires_at - now).num_seconds(),
        })
    }

    /// Resolve a signed token against the job's current state.
    ///
    /// Fails with `Expired` once the link or the artifact itself has lapsed,
    /// including when the artifact was revoked by feedback or retention.
    pub async fn resolve(
        &self,
        signed: &str,
        now: DateTime<Utc>,
        store: &JobStore,
    ) -> Result<ResolvedArtifact, DeliveryError> {
        let token = ArtifactToken::verify(signed, &self.secret)?;
        if token.is_expired(now) {
            return Err(JobError::Expired("artifact link has expired".to_string()).into());
        }

        let job = store.get(token.jid).await?;
        let live = job.status.holds_artifact()
            && !job.is_artifact_expired(now)
            && job.artifact_ref.as_deref() == Some(token.art.as_str());
        if !live {
            return Err(JobError::Expired(format!(
                "artifact for job {} is no longer available",
                job.id
            ))
            .into());
        }

        Ok(ResolvedArtifact {
            job_id: job.id,
            artifact_ref: token.art,
            expires_at: Utc
                .timestamp_opt(token.exp, 0)
                .single()
                .unwrap_or(now),
        })
    }
}
