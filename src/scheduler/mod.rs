//! Schedules and their runtime
//!
//! Every subscription belongs to exactly one named schedule. Each schedule
//! runs its own cycles on its own timer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     ScheduleManager                       │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐    │
//! │  │   Trigger    │  │   Trigger    │  │   Trigger    │    │
//! │  │  "default"   │  │ "supporter"  │  │   custom     │    │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘    │
//! │         ▼                 ▼                 ▼            │
//! │   Orchestrator       Orchestrator      Orchestrator      │
//! └─────────┼─────────────────┼─────────────────┼────────────┘
//!           └─────────────────┼─────────────────┘
//!                             ▼
//!                 NewArticle ─▶ DeliveryPipeline
//! ```
//!
//! # Modules
//!
//! - [`schedule`] - Schedule definitions and startup validation
//! - [`resolver`] - Subscription to schedule assignment
//! - [`trigger`] - Interval trigger per schedule
//! - [`manager`] - Starts, stops and refreshes
//! - [`error`] - Scheduler error types

pub mod error;
pub mod manager;
pub mod resolver;
pub mod schedule;
pub mod trigger;

pub use error::{SchedulerError, SchedulerResult};
pub use manager::{RefreshReport, ScheduleManager};
pub use resolver::{count_by_schedule, resolve};
pub use schedule::{FastTier, Schedule, ScheduleSet, DEFAULT_SCHEDULE, SUPPORTER_SCHEDULE};
pub use trigger::{ScheduleTrigger, TriggerEvent};
