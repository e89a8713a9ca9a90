//! Prometheus exporter and server-side metrics. Engine metrics are recorded
//! by `ci_engine::metrics` and exported through the same recorder.

use metrics::{counter, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a webhook received event.
pub fn webhook_received(event_type: &str) {
    counter!("ci_webhooks_received_total", "event" => event_type.to_string()).increment(1);
}

/// Record step duration.
pub fn step_duration(step_name: &str, duration_ms: u64) {
    histogram!("ci_step_duration_ms", "step" => step_name.to_string()).record(duration_ms as f64);
}

/// Record a failed outbound notification.
pub fn notification_failed(kind: &str) {
    counter!("ci_notifications_failed_total", "kind" => kind.to_string()).increment(1);
}
