//! Application configuration module
//!
//! Settings are layered: built-in defaults, then `REEL_*` environment
//! variables (nested with `__`, e.g. `REEL_PIPELINE__MAX_CONCURRENT_STAGES`),
//! then the conventional `HOST`, `PORT`, `ALLOWED_ORIGINS` and `JWT_SECRET`
//! variables used by container platforms. A `.env` file is loaded first when present.

use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::{ArtifactLinks, PipelineConfig, SchedulerConfig, StageTimeouts};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::new(0, 0, 0, 0), // Bind to 0.0.0.0 for Docker
            port: 3000,
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3001".to_string()],
        }
    }
}

/// Scheduler and stage execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub max_concurrent_stages: usize,
    pub max_concurrent_renders: usize,
    /// Consecutive failures of one stage before the job fails
    pub stage_retry_limit: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_secs: u64,
    pub download_timeout_secs: u64,
    /// Analysis, mix and render
    pub processing_timeout_secs: u64,
    pub reconcile_interval_secs: u64,
    /// Where the local processors write stage outputs
    pub work_dir: PathBuf,
    /// Music library; track ids are checked against it when set
    pub music_dir: Option<PathBuf>,
    pub simulated_latency_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_stages: 4,
            max_concurrent_renders: 1,
            stage_retry_limit: 3,
            retry_base_delay_ms: 2_000,
            retry_max_delay_secs: 300,
            download_timeout_secs: 1_800,
            processing_timeout_secs: 600,
            reconcile_interval_secs: 30,
            work_dir: PathBuf::from("data/work"),
            music_dir: None,
            simulated_latency_ms: 250,
        }
    }
}

/// Artifact and record lifetimes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub delivery_ttl_secs: u64,
    pub archive_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            delivery_ttl_secs: 6 * 60 * 60,
            archive_ttl_secs: 24 * 60 * 60,
            sweep_interval_secs: 60,
        }
    }
}

/// Signed artifact links
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    pub signing_secret: String,
    pub public_base_url: String,
    pub link_ttl_secs: u64,
}

pub const DEV_SIGNING_SECRET: &str = "reel-pipeline-dev-signing-secret";
pub const DEV_JWT_SECRET: &str = "reel-pipeline-dev-secret-change-in-production";

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            signing_secret: DEV_SIGNING_SECRET.to_string(),
            public_base_url: "http://localhost:3000".to_string(),
            link_ttl_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Verifies administrator Bearer tokens
    pub jwt_secret: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: DEV_JWT_SECRET.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub submissions_per_minute: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            submissions_per_minute: 30,
        }
    }
}

/// Complete application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub cors: CorsConfig,
    pub pipeline: PipelineSettings,
    pub retention: RetentionSettings,
    pub delivery: DeliverySettings,
    pub auth: AuthSettings,
    pub rate_limit: RateLimitSettings,
}

impl Settings {
    /// Load settings from the environment
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();

        let mut settings: Settings = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("REEL")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        if let Some(host) = std::env::var("HOST").ok().and_then(|h| h.parse().ok()) {
            settings.server.host = host;
        }
        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            settings.server.port = port;
        }
        if let Ok(origins) = std::env::var("ALLOWED_ORIGINS") {
            settings.cors.allowed_origins = parse_origins(&origins);
        }
        if let Ok(secret) = std::env::var("JWT_SECRET") {
            settings.auth.jwt_secret = secret;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pipeline = &self.pipeline;
        if pipeline.max_concurrent_stages == 0 {
            return Err(ConfigError::InvalidValue(
                "pipeline.max_concurrent_stages must be at least 1".to_string(),
            ));
        }
        if pipeline.max_concurrent_renders == 0 {
            return Err(ConfigError::InvalidValue(
                "pipeline.max_concurrent_renders must be at least 1".to_string(),
            ));
        }
        if pipeline.stage_retry_limit == 0 {
            return Err(ConfigError::InvalidValue(
                "pipeline.stage_retry_limit must be at least 1".to_string(),
            ));
        }
        if self.retention.delivery_ttl_secs == 0 || self.delivery.link_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "delivery and link TTLs must be positive".to_string(),
            ));
        }
        if self.retention.sweep_interval_secs == 0 || pipeline.reconcile_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "sweep and reconcile intervals must be positive".to_string(),
            ));
        }
        if self.delivery.signing_secret.is_empty() || self.auth.jwt_secret.is_empty() {
            return Err(ConfigError::InvalidValue(
                "signing and JWT secrets must not be empty".to_string(),
            ));
        }
        if self.rate_limit.submissions_per_minute == 0 {
            return Err(ConfigError::InvalidValue(
                "rate_limit.submissions_per_minute must be at least 1".to_string(),
            ));
        }
        url::Url::parse(&self.delivery.public_base_url).map_err(|_| {
            ConfigError::InvalidValue(format!(
                "delivery.public_base_url '{}' is not a valid URL",
                self.delivery.public_base_url
            ))
        })?;
        Ok(())
    }

    /// Assemble the pipeline's runtime configuration
    pub fn pipeline_config(&self) -> PipelineConfig {
        let pipeline = &self.pipeline;
        let retention = &self.retention;
        PipelineConfig {
            scheduler: SchedulerConfig {
                max_concurrent_stages: pipeline.max_concurrent_stages,
                max_concurrent_renders: pipeline.max_concurrent_renders,
                retry: RetryPolicy {
                    limit: pipeline.stage_retry_limit,
                    base_delay: chrono::Duration::milliseconds(pipeline.retry_base_delay_ms as i64),
                    max_delay: chrono::Duration::seconds(pipeline.retry_max_delay_secs as i64),
                },
                delivery_ttl: chrono::Duration::seconds(retention.delivery_ttl_secs as i64),
                reconcile_interval: Duration::from_secs(pipeline.reconcile_interval_secs),
            },
            timeouts: StageTimeouts {
                download: Duration::from_secs(pipeline.download_timeout_secs),
                processing: Duration::from_secs(pipeline.processing_timeout_secs),
            },
            archive_ttl: chrono::Duration::seconds(retention.archive_ttl_secs as i64),
            sweep_interval: Duration::from_secs(retention.sweep_interval_secs),
            links: ArtifactLinks::new(
                self.delivery.signing_secret.clone(),
                self.delivery.public_base_url.clone(),
                chrono::Duration::seconds(self.delivery.link_ttl_secs as i64),
            ),
        }
    }

    /// Whether either secret is still the built-in development value
    pub fn uses_dev_secrets(&self) -> bool {
        self.auth.jwt_secret == DEV_JWT_SECRET || self.delivery.signing_secret == DEV_SIGNING_SECRET
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
