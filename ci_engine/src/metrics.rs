//! Engine metrics. Exporting them is up to the embedding process.

use metrics::{counter, gauge, histogram};

/// Record a change accepted by ingress.
pub fn change_received() {
    counter!("ci_changes_received_total").increment(1);
}

/// Record a change dropped by a scheduler's filter.
pub fn change_filtered(scheduler: &str) {
    counter!("ci_changes_filtered_total", "scheduler" => scheduler.to_string()).increment(1);
}

/// Record a stable set emitted by the tree-stable timer.
pub fn stable_set_emitted(scheduler: &str, size: usize) {
    counter!("ci_stable_sets_total", "scheduler" => scheduler.to_string()).increment(1);
    histogram!("ci_stable_set_size").record(size as f64);
}

pub fn build_set_created() {
    counter!("ci_build_sets_total").increment(1);
}

pub fn build_set_finished(status: &str) {
    counter!("ci_build_sets_finished_total", "status" => status.to_string()).increment(1);
}

pub fn request_merged(builder: &str) {
    counter!("ci_requests_merged_total", "builder" => builder.to_string()).increment(1);
}

/// Set the number of unclaimed requests for a builder.
pub fn queue_depth(builder: &str, depth: usize) {
    gauge!("ci_queue_depth", "builder" => builder.to_string()).set(depth as f64);
}

/// Record a build state transition.
pub fn build_status_changed(status: &str) {
    counter!("ci_builds_total", "status" => status.to_string()).increment(1);
}

/// Record build duration.
pub fn build_duration(duration_ms: u64) {
    histogram!("ci_build_duration_ms").record(duration_ms as f64);
}
