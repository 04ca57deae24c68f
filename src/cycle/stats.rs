//! CycleStats persistence after a completed cycle

use chrono::Utc;

use crate::metrics;
use crate::models::CycleStats;
use crate::storage::SharedStore;

/// Raw measurements of one cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleMeasurement {
    pub subscription_count: u64,
    pub elapsed_seconds: f64,
    pub fail_count: u64,
    pub url_count: u64,
}

/// Merge a measurement into the schedule's row; errors are logged only
pub async fn record_cycle_stats(
    store: &SharedStore,
    schedule: &str,
    measurement: CycleMeasurement,
) -> Option<CycleStats> {
    let previous = match store.cycle_stats(schedule).await {
        Ok(previous) => previous,
        Err(e) => {
            tracing::warn!(schedule, error = %e, "Failed to load previous cycle stats");
            None
        }
    };

    let current = CycleStats {
        schedule_name: schedule.to_string(),
        subscription_count: measurement.subscription_count,
        cycle_time_seconds: measurement.elapsed_seconds,
        cycle_fail_count: measurement.fail_count,
        cycle_url_count: measurement.url_count,
        last_updated: Utc::now(),
    };
    let merged = CycleStats::merge(previous.as_ref(), current);

    match store.upsert_cycle_stats(&merged).await {
        Ok(()) => Some(merged),
        Err(e) => {
            metrics::record_persistence_error("cycle_stats");
            tracing::error!(schedule, error = %e, "Failed to persist cycle stats");
            None
        }
    }
}
