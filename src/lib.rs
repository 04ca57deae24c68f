//! feedwire - scheduled feed polling with rate-limited fan-out delivery
//!
//! Subscriptions map a feed URL to a chat destination. Every subscription
//! belongs to one named schedule; each schedule runs periodic cycles that
//! fetch its URLs in batches, detect items that were not seen before, and
//! hand them to the delivery pipeline.
//!
//! # Modules
//!
//! - [`config`] - TOML and `FEEDWIRE_*` environment configuration
//! - [`scheduler`] - Schedules, subscription assignment and interval triggers
//! - [`cycle`] - Batching, workers and the per-schedule cycle orchestrator
//! - [`identity`] - Item identity and new-item detection
//! - [`fetch`] - HTTP feed fetching with conditional requests
//! - [`failure`] - Per-URL failure tracking and outage alerts
//! - [`delivery`] - Rendering, per-destination rate limits and transports
//! - [`storage`] - Persistence backends (SQLite, files, memory)
//! - [`models`] - Subscriptions, items and persisted records
//! - [`metrics`] - Prometheus metrics
//! - [`utils`] - URL helpers and store read retries
//!
//! # Loading schedules
//!
//! ```no_run
//! use feedwire::config::Config;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     config.validate()?;
//!     let schedules = config.schedule_set()?;
//!     println!("{} schedules", schedules.len());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod cycle;
pub mod delivery;
pub mod error;
pub mod failure;
pub mod fetch;
pub mod identity;
pub mod metrics;
pub mod models;
pub mod scheduler;
pub mod storage;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::cycle::{CycleOrchestrator, CycleReport};
    pub use crate::delivery::{DeliveryMode, DeliveryOutcome, DeliveryPipeline};
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::models::{FailRecord, NewArticle, Subscription};
    pub use crate::scheduler::{ScheduleManager, ScheduleSet};
    pub use crate::storage::{SharedStore, Store};
}

// Direct re-exports for convenience
pub use models::{CycleStats, DeliveryRecord, FailRecord, NewArticle, Subscription};
