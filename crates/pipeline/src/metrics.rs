//! Prometheus metrics for the delivery pipeline.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use herald_common::types::NotificationType;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize the Prometheus recorder.
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() {
    let _ = PROMETHEUS_HANDLE.get_or_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("Failed to install Prometheus recorder");
        tracing::info!("Prometheus metrics initialized");
        handle
    });
}

/// Render metrics in Prometheus exposition format.
pub fn render_metrics() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Update the queue depth gauge.
pub fn queue_depth(depth: u64) {
    gauge!("herald_queue_depth").set(depth as f64);
}

/// Update the active per-message worker gauge.
pub fn active_workers(count: usize) {
    gauge!("herald_active_workers").set(count as f64);
}

/// Count one processed message, tagged by type and outcome.
pub fn processed(notification_type: NotificationType, status: &str) {
    counter!(
        "herald_processed_total",
        "type" => notification_type.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record end-to-end processing time for one message.
pub fn processing_duration(notification_type: NotificationType, duration: Duration) {
    histogram!(
        "herald_processing_duration_seconds",
        "type" => notification_type.to_string()
    )
    .record(duration.as_secs_f64());
}
