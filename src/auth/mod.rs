//! Authentication and authorization module
//!
//! Token issuance lives with the identity provider; this service only
//! verifies Bearer JWTs and gates review and administrator operations on
//! the role claim.

mod jwt;
mod middleware;

pub use jwt::{decode_token, Claims};
pub use middleware::{require_admin, require_reviewer};

#[cfg(test)]
pub(crate) use jwt::issue_token;

use serde::{Deserialize, Serialize};

/// Caller roles for authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Can follow job progress
    #[default]
    Viewer,
    /// Can review deliveries and submit feedback
    Reviewer,
    /// Can cancel jobs and run stages by hand
    Admin,
}

impl Role {
    pub fn can_review(&self) -> bool {
        matches!(self, Role::Reviewer | Role::Admin)
    }

    pub fn can_administer(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Viewer => write!(f, "viewer"),
            Role::Reviewer => write!(f, "reviewer"),
            Role::Admin => write!(f, "admin"),
        }
    }
}
