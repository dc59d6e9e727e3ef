//! Data models and DTOs (Data Transfer Objects)
//!
//! Contains all request/response structures used by the API.
//! `SuccessResponse` flattens its data, so `T` must serialize as a map.

pub mod job;

// Re-export commonly used types
pub use job::*;

use serde::Serialize;

/// Generic success response
#[derive(Serialize)]
pub struct SuccessResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub data: Option<T>,
}

impl<T: Serialize> SuccessResponse<T> {
    pub fn with_data(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }
}
