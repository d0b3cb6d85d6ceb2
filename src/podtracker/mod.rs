//! Maps pod events onto manifests via ancestor UID and pod-template-spec
//! hash, and detects live-update crashes (spec.md §4.7).

use std::collections::HashSet;

use crate::domain::runtime::{K8sRuntimeState, Pod, PodAttachment};

/// The kind of `K8sDiscovery*` event carried by a `K8sDiscoveryAction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodEventKind {
    Create,
    Update,
    Delete,
}

/// Applies one pod event to a manifest's runtime state, per the state
/// machine in spec.md §4.7. Returns `true` if the event mutated `k8s`.
pub fn apply_pod_event(k8s: &mut K8sRuntimeState, kind: PodEventKind, pod: Pod) -> bool {
    if kind == PodEventKind::Delete {
        return k8s.pods.remove(&pod.name).is_some();
    }

    if let Some(existing) = k8s.pods.get(&pod.name) {
        // Boundary behavior (spec.md §8): an older resource_version is dropped.
        if pod.resource_version <= existing.resource_version {
            return false;
        }
        let mut updated = pod;
        updated.attachment = PodAttachment::Updated;
        k8s.pods.insert(updated.name.clone(), updated);
        return true;
    }

    // Boundary behavior: unknown ancestor AND unknown hash is dropped
    // without creating a `Pods` entry.
    if !k8s.matches_current_deploy(&pod.ancestor_uid, &pod.pod_template_spec_hash) {
        return false;
    }

    let mut attached = pod;
    attached.attachment = PodAttachment::Attached;
    k8s.pods.insert(attached.name.clone(), attached);
    true
}

/// Crash detection per spec.md §4.7: on a `BuildComplete` whose result set
/// included live-updated container ids, compare the most recent pod's
/// containers against them. If none match, the in-place update was lost to a
/// container restart and a rebuild is owed.
pub fn needs_rebuild_from_crash(
    k8s: &K8sRuntimeState,
    live_updated_container_ids: &HashSet<String>,
) -> bool {
    if live_updated_container_ids.is_empty() {
        return false;
    }
    match k8s.most_recent_pod() {
        Some(pod) => !pod
            .container_ids
            .iter()
            .any(|id| live_updated_container_ids.contains(id)),
        None => false,
    }
}

/// After a successful non-live-update deploy, baseline every known pod's
/// restart count so historical restarts never read as crashes.
pub fn stamp_baseline_restarts(k8s: &mut K8sRuntimeState) {
    let restarts: Vec<(String, i32)> = k8s
        .pods
        .values()
        .map(|p| (p.name.clone(), p.restart_count))
        .collect();
    for (name, count) in restarts {
        k8s.baseline_restarts.insert(name, count);
    }
}
