//! Prometheus metrics for feedwire cycles and deliveries
//!
//! This module tracks:
//! - Cycles: duration, URLs fetched, failures, hung URLs per schedule
//! - Delivery: outcomes, pending queue depth
//! - Failures: outage alerts, persistence errors
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec,
    TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for cycle metrics
struct CycleMetrics {
    cycle_duration: HistogramVec,
    cycles: CounterVec,
    urls_fetched: CounterVec,
    url_failures: CounterVec,
    url_results: CounterVec,
    hung_urls: GaugeVec,
}

/// Container for delivery metrics
struct DeliveryMetrics {
    deliveries: CounterVec,
    queue_depth: Gauge,
    outage_alerts: Counter,
    persistence_errors: CounterVec,
}

static CYCLE_METRICS: OnceLock<CycleMetrics> = OnceLock::new();

static DELIVERY_METRICS: OnceLock<DeliveryMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Registration failures are returned once; every recorder keeps working as
/// a no-op afterwards.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = feedwire::metrics::init_metrics() {
///     tracing::warn!(error = %e, "Metrics disabled");
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let cycle = CycleMetrics {
        cycle_duration: register_histogram_vec!(
            "feedwire_cycle_duration_seconds",
            "Time spent on one cycle in seconds",
            &["schedule"],
            vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]
        )?,
        cycles: register_counter_vec!(
            "feedwire_cycles_total",
            "Completed cycles per schedule",
            &["schedule"]
        )?,
        urls_fetched: register_counter_vec!(
            "feedwire_cycle_urls_total",
            "URLs handled by cycles per schedule",
            &["schedule"]
        )?,
        url_failures: register_counter_vec!(
            "feedwire_cycle_url_failures_total",
            "URLs that failed during cycles per schedule",
            &["schedule"]
        )?,
        url_results: register_counter_vec!(
            "feedwire_url_results_total",
            "Per-URL fetch results",
            &["schedule", "result"]
        )?,
        hung_urls: register_gauge_vec!(
            "feedwire_hung_urls",
            "URLs without a terminal reply at the end of the last cycle",
            &["schedule"]
        )?,
    };

    let delivery = DeliveryMetrics {
        deliveries: register_counter_vec!(
            "feedwire_deliveries_total",
            "Delivery outcomes",
            &["outcome"]
        )?,
        queue_depth: register_gauge!(
            "feedwire_delivery_queue_depth",
            "Jobs waiting in destination queues"
        )?,
        outage_alerts: register_counter!(
            "feedwire_outage_alerts_total",
            "Outage alerts raised for failing URLs"
        )?,
        persistence_errors: register_counter_vec!(
            "feedwire_persistence_errors_total",
            "Best-effort writes that failed",
            &["kind"]
        )?,
    };

    CYCLE_METRICS.set(cycle).map_err(|_| "Cycle metrics already initialized")?;
    DELIVERY_METRICS
        .set(delivery)
        .map_err(|_| "Delivery metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    CYCLE_METRICS.get().is_some() && DELIVERY_METRICS.get().is_some()
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// ============================================================================
// Cycle Metrics
// ============================================================================

/// Record a finished cycle
pub fn record_cycle(schedule: &str, duration_secs: f64, urls: u64, failures: u64) {
    let Some(m) = CYCLE_METRICS.get() else {
        return;
    };

    m.cycle_duration
        .with_label_values(&[schedule])
        .observe(duration_secs);
    m.cycles.with_label_values(&[schedule]).inc();
    m.urls_fetched
        .with_label_values(&[schedule])
        .inc_by(urls as f64);
    if failures > 0 {
        m.url_failures
            .with_label_values(&[schedule])
            .inc_by(failures as f64);
    }
}

/// Record one URL's terminal reply
pub fn record_url_result(schedule: &str, success: bool) {
    if let Some(m) = CYCLE_METRICS.get() {
        let result = if success { "success" } else { "failed" };
        m.url_results.with_label_values(&[schedule, result]).inc();
    }
}

pub fn set_hung_urls(schedule: &str, count: usize) {
    if let Some(m) = CYCLE_METRICS.get() {
        m.hung_urls.with_label_values(&[schedule]).set(count as f64);
    }
}

// ============================================================================
// Delivery Metrics
// ============================================================================

/// Record a delivery outcome (sent, blocked, not_owned, failed)
pub fn record_delivery(outcome: &str) {
    if let Some(m) = DELIVERY_METRICS.get() {
        m.deliveries.with_label_values(&[outcome]).inc();
    }
}

pub fn set_queue_depth(depth: usize) {
    if let Some(m) = DELIVERY_METRICS.get() {
        m.queue_depth.set(depth as f64);
    }
}

pub fn record_outage_alert() {
    if let Some(m) = DELIVERY_METRICS.get() {
        m.outage_alerts.inc();
    }
}

/// Record a failed best-effort write
pub fn record_persistence_error(kind: &str) {
    if let Some(m) = DELIVERY_METRICS.get() {
        m.persistence_errors.with_label_values(&[kind]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ensure_metrics_initialized() {
        let _ = init_metrics();
    }

    #[test]
    fn test_init_metrics() {
        ensure_metrics_initialized();
        // A second call is a no-op
        assert!(init_metrics().is_ok());
        assert!(metrics_initialized());
    }

    #[test]
    fn test_encode_metrics() {
        ensure_metrics_initialized();
        record_cycle("default", 1.5, 10, 2);
        let output = encode_metrics().unwrap();
        assert!(output.contains("feedwire_cycle_duration_seconds"));
    }

    #[test]
    fn test_delivery_recording() {
        ensure_metrics_initialized();
        record_delivery("sent");
        record_delivery("blocked");
        set_queue_depth(3);
        record_outage_alert();
        record_persistence_error("cycle_stats");
        let output = encode_metrics().unwrap();
        assert!(output.contains("feedwire_deliveries_total"));
        assert!(output.contains("feedwire_delivery_queue_depth"));
    }

    #[test]
    fn test_cycle_recording() {
        ensure_metrics_initialized();
        record_url_result("default", true);
        record_url_result("default", false);
        set_hung_urls("default", 4);
    }
}
