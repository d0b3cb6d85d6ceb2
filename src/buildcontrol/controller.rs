//! Picks the next target to build; enforces parallelism and holds
//! (spec.md §4.4).

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::domain::build_result::BuildReason;
use crate::domain::manifest::TriggerMode;
use crate::domain::target::ManifestName;
use crate::store::state::EngineState;

/// Sentinel name under which the configuration-evaluation pseudo-manifest is
/// tracked in `currently_building` and `trigger_queue` (spec.md §4.8).
pub fn tiltfile_name() -> ManifestName {
    ManifestName::new("(Tiltfile)")
}

/// Every path with a pending change across the manifest's targets, gathered
/// just before dispatching `BuildStarted` so the build record's edit list
/// matches what actually triggered the build.
pub fn pending_files_for(state: &EngineState, manifest_name: &ManifestName) -> Vec<std::path::PathBuf> {
    let Some(manifest_state) = state.manifest_state(manifest_name) else {
        return Vec::new();
    };
    let mut paths: Vec<std::path::PathBuf> = manifest_state
        .build_statuses
        .values()
        .flat_map(|status| status.pending_file_changes.keys().cloned())
        .collect();
    paths.sort();
    paths.dedup();
    paths
}

/// Why a manifest is not currently eligible to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldReason {
    TiltfileBuilding,
    NoParallelSlots,
    WaitingForDeploy,
    TriggerModeManual,
    NoBuildReason,
}

#[derive(Debug, Default)]
pub struct NextBuild {
    pub name: Option<ManifestName>,
    pub reason: BuildReason,
    pub holds: HashMap<ManifestName, HoldReason>,
}

fn next_build_reason(state: &EngineState, manifest_name: &ManifestName) -> BuildReason {
    let manifest = match state.manifest(manifest_name) {
        Some(m) => m,
        None => return BuildReason::NONE,
    };
    let manifest_state = match state.manifest_state(manifest_name) {
        Some(s) => s,
        None => return BuildReason::NONE,
    };

    let mut reason = manifest_state.trigger_reason;
    for status in manifest_state.build_statuses.values() {
        if !status.pending_file_changes.is_empty() {
            reason |= BuildReason::CHANGED_FILES;
        }
        if !status.pending_dependency_changes.is_empty() {
            reason |= BuildReason::CHANGED_DEPS;
        }
    }
    if manifest_state.pending_manifest_change.is_some() {
        reason |= BuildReason::PENDING_MANIFEST_CHANGE;
    }
    if manifest_state.needs_rebuild_from_crash {
        reason |= BuildReason::CRASH;
    }
    let never_built = manifest_state.build_history.is_empty() && manifest_state.current_build.is_none();
    if manifest.trigger_mode.auto_initial() && never_built {
        reason |= BuildReason::INITIAL_BUILD;
    }
    reason
}

/// Rule 4: explicit triggers beat file/dependency/crash changes beat initial
/// builds. Lower rank wins.
fn priority_rank(reason: BuildReason) -> u8 {
    if reason.contains(BuildReason::TRIGGER_QUEUE) {
        0
    } else if reason.intersects(
        BuildReason::CHANGED_FILES | BuildReason::CHANGED_DEPS | BuildReason::PENDING_MANIFEST_CHANGE | BuildReason::CRASH,
    ) {
        1
    } else {
        2
    }
}

fn oldest_pending_timestamp(state: &EngineState, manifest_name: &ManifestName) -> DateTime<Utc> {
    let Some(manifest_state) = state.manifest_state(manifest_name) else {
        return DateTime::<Utc>::UNIX_EPOCH;
    };
    let mut ts = manifest_state.pending_manifest_change;
    for status in manifest_state.build_statuses.values() {
        if let Some(t) = status.oldest_pending_timestamp() {
            ts = Some(ts.map_or(t, |cur| cur.min(t)));
        }
    }
    ts.unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn dependencies_resolved(state: &EngineState, manifest_name: &ManifestName, self_ts: DateTime<Utc>) -> bool {
    let Some(manifest) = state.manifest(manifest_name) else {
        return true;
    };
    manifest.resource_dependencies.iter().all(|dep| match state.manifest_state(dep) {
        Some(dep_state) => dep_state
            .last_successful_deploy_time
            .map(|t| t >= self_ts)
            .unwrap_or(false),
        None => false,
    })
}

fn live_update_pod_has_reported(state: &EngineState, manifest_name: &ManifestName) -> bool {
    let Some(manifest_state) = state.manifest_state(manifest_name) else {
        return true;
    };
    if manifest_state.live_updated_container_ids.is_empty() {
        return true;
    }
    let Some(last_record) = manifest_state.build_history.first() else {
        return true;
    };
    manifest_state
        .runtime_state
        .as_ref()
        .and_then(|rs| rs.as_k8s())
        .map(|k8s| k8s.pods.values().any(|p| p.creation_time >= last_record.start_time))
        .unwrap_or(false)
}

fn trigger_mode_allows(state: &EngineState, manifest_name: &ManifestName) -> bool {
    let Some(manifest) = state.manifest(manifest_name) else {
        return false;
    };
    if manifest.trigger_mode.auto_on_change() {
        return true;
    }
    if state.trigger_queue.contains(manifest_name) {
        return true;
    }
    let never_built = state
        .manifest_state(manifest_name)
        .map(|s| s.build_history.is_empty() && s.current_build.is_none())
        .unwrap_or(true);
    matches!(manifest.trigger_mode, TriggerMode::ManualWithAutoInitial) && never_built
}

/// `NextTargetToBuild(state)` from spec.md §4.4.
pub fn next_target_to_build(state: &EngineState) -> NextBuild {
    let tilt_name = tiltfile_name();

    if state.currently_building.contains(&tilt_name) {
        let holds = state
            .manifest_definition_order
            .iter()
            .map(|n| (n.clone(), HoldReason::TiltfileBuilding))
            .collect();
        return NextBuild {
            name: None,
            reason: BuildReason::NONE,
            holds,
        };
    }

    let tiltfile_pending = state.trigger_queue.contains(&tilt_name)
        || state.tiltfile_state.pending_manifest_change.is_some()
        || state
            .tiltfile_state
            .build_statuses
            .values()
            .any(|s| !s.pending_file_changes.is_empty());

    if tiltfile_pending && state.available_build_slots() > 0 {
        return NextBuild {
            name: Some(tilt_name),
            reason: BuildReason::TRIGGER_QUEUE,
            holds: HashMap::new(),
        };
    }

    let mut holds = HashMap::new();
    let mut best: Option<(ManifestName, BuildReason, u8, DateTime<Utc>)> = None;

    if state.available_build_slots() == 0 {
        for name in &state.manifest_definition_order {
            if !state.currently_building.contains(name) {
                holds.insert(name.clone(), HoldReason::NoParallelSlots);
            }
        }
        return NextBuild {
            name: None,
            reason: BuildReason::NONE,
            holds,
        };
    }

    for name in &state.manifest_definition_order {
        if state.currently_building.contains(name) {
            continue;
        }
        let reason = next_build_reason(state, name);
        if reason == BuildReason::NONE {
            holds.insert(name.clone(), HoldReason::NoBuildReason);
            continue;
        }
        if !trigger_mode_allows(state, name) {
            holds.insert(name.clone(), HoldReason::TriggerModeManual);
            continue;
        }
        let ts = oldest_pending_timestamp(state, name);
        if !dependencies_resolved(state, name, ts) {
            holds.insert(name.clone(), HoldReason::WaitingForDeploy);
            continue;
        }
        if !live_update_pod_has_reported(state, name) {
            holds.insert(name.clone(), HoldReason::WaitingForDeploy);
            continue;
        }

        let rank = priority_rank(reason);
        let better = match &best {
            None => true,
            Some((_, _, best_rank, best_ts)) => (rank, ts) < (*best_rank, *best_ts),
        };
        if better {
            best = Some((name.clone(), reason, rank, ts));
        }
    }

    match best {
        Some((name, reason, ..)) => NextBuild {
            name: Some(name),
            reason,
            holds,
        },
        None => NextBuild {
            name: None,
            reason: BuildReason::NONE,
            holds,
        },
    }
}
