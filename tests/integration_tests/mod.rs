//! Integration tests module
//!
//! End-to-end tests of feedwire over in-memory collaborators:
//! - Cycle orchestration, batching and hang reporting
//! - Failure backoff, outage alerts and manual refresh
//! - Rate-limited, ordered delivery
//! - Schedule triggers and the schedule manager

pub mod cycle_test;
pub mod delivery_test;
pub mod failure_test;
pub mod fixtures;
pub mod scheduler_test;
