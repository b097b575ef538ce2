//! Pending-mutator sentinel
//!
//! The sentinel is a scheduling gate named after the initializer. While it is
//! present the scheduler leaves the pod alone; removing it releases the pod.
//!
//! A real API server accepts gate removal on an existing pod but rejects
//! added volumes, mounts and env vars, even while the pod is gated. Only the
//! release path is a valid post-creation write there.

use k8s_openapi::api::core::v1::Pod;

/// Whether the pod still waits for the named initializer
pub fn has_marker(pod: &Pod, initializer_name: &str) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.scheduling_gates.as_ref())
        .map(|gates| gates.iter().any(|g| g.name == initializer_name))
        .unwrap_or(false)
}

/// Remove the named initializer's gate, keeping the others in order.
///
/// An emptied list is removed entirely. Returns whether anything changed.
pub fn remove_marker(pod: &mut Pod, initializer_name: &str) -> bool {
    let Some(spec) = pod.spec.as_mut() else {
        return false;
    };
    let Some(gates) = spec.scheduling_gates.as_mut() else {
        return false;
    };

    let before = gates.len();
    gates.retain(|g| g.name != initializer_name);
    let removed = gates.len() != before;
    if gates.is_empty() {
        spec.scheduling_gates = None;
    }
    removed
}
