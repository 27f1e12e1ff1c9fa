//! Prometheus metrics for lifecycle observability

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, Encoder, Histogram, IntCounter, TextEncoder,
};

lazy_static! {
    /// Wall-clock time of a successful start, from validation to Running.
    pub static ref VM_START_DURATION: Histogram = register_histogram!(
        "vmshepherd_vm_start_duration_seconds",
        "Time to take a VM from validation to the Running state",
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("register vmshepherd_vm_start_duration_seconds");

    pub static ref VM_STARTS_TOTAL: IntCounter = register_int_counter!(
        "vmshepherd_vm_starts_total",
        "Successful VM starts"
    )
    .expect("register vmshepherd_vm_starts_total");

    pub static ref VM_START_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "vmshepherd_vm_start_failures_total",
        "VM starts that failed and were rolled back"
    )
    .expect("register vmshepherd_vm_start_failures_total");

    pub static ref VM_STOPS_TOTAL: IntCounter = register_int_counter!(
        "vmshepherd_vm_stops_total",
        "Completed VM stops"
    )
    .expect("register vmshepherd_vm_stops_total");

    /// Each retry of a busy cgroup removal during teardown.
    pub static ref CGROUP_REMOVE_RETRIES_TOTAL: IntCounter = register_int_counter!(
        "vmshepherd_cgroup_remove_retries_total",
        "Retries of VM cgroup removal on a busy hierarchy"
    )
    .expect("register vmshepherd_cgroup_remove_retries_total");
}

/// Render all registered metrics in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_after_touch() {
        VM_STOPS_TOTAL.inc();
        let text = gather();
        assert!(text.contains("vmshepherd_vm_stops_total"));
    }
}
