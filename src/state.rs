//! Application state management
//!
//! Contains shared state accessible across all handlers.

use crate::config::Settings;
use crate::pipeline::Pipeline;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Instant;

/// Application state shared across all handlers
pub struct AppState {
    pub settings: Settings,

    /// Job store, scheduler, feedback, retention and delivery links
    pub pipeline: Pipeline,

    /// Global quota on job submissions
    pub submissions: DefaultDirectRateLimiter,

    pub started_at: Instant,
}

impl AppState {
    pub fn new(settings: Settings, pipeline: Pipeline) -> Self {
        let per_minute = NonZeroU32::new(settings.rate_limit.submissions_per_minute)
            .unwrap_or(NonZeroU32::MIN);
        Self {
            submissions: RateLimiter::direct(Quota::per_minute(per_minute)),
            settings,
            pipeline,
            started_at: Instant::now(),
        }
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
