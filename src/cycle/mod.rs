//! Per-schedule fetch cycles
//!
//! # Modules
//!
//! - [`batching`] - Eligibility filter, URL grouping, batches and batch groups
//! - [`worker`] - Batch worker and the orchestrator/worker message protocol
//! - [`tracker`] - Outstanding ("hung") URL bookkeeping
//! - [`orchestrator`] - Drives one cycle from loading to stats
//! - [`stats`] - CycleStats persistence

pub mod batching;
pub mod orchestrator;
pub mod stats;
pub mod tracker;
pub mod worker;

pub use batching::{Batch, BatchGroup, Eligibility};
pub use orchestrator::{CycleOrchestrator, CyclePhase, CycleReport, CycleSettings, CycleState};
pub use stats::CycleMeasurement;
pub use tracker::{HangTracker, HungUrl};
pub use worker::{DebugTargets, Worker, WorkerJob, WorkerMessage, WorkerSettings, WorkerStatus};
