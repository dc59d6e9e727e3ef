//! Jobs module
//!
//! The job record, its status state machine and the versioned store.

pub mod models;
pub mod store;

pub use models::*;
pub use store::{JobFilter, JobStore, TransitionOptions};
