//! Pure function `(EngineState, Action) -> ChangeSummary` (spec.md §4.2)

use std::sync::Arc;

use crate::domain::build_result::BuildReason;
use crate::domain::manifest_state::ManifestState;
use crate::domain::runtime::RuntimeState;
use crate::domain::target::{ManifestName, TargetKind};
use crate::podtracker;
use crate::store::actions::{Action, ChangeSummary, FileWatchKind, Summarize};
use crate::store::state::EngineState;

/// Applies one action to `state`, returning the `ChangeSummary` the Store
/// will fan out to subscribers. Never blocks, never performs I/O.
pub fn reduce(state: &mut EngineState, action: Action) -> ChangeSummary {
    if state.fatal_error.is_some() && !action.runs_during_fatal_error() {
        return ChangeSummary::default();
    }

    let summary = action.summarize();
    match action {
        Action::Init(a) => {
            state.tiltfile_path = Some(a.tiltfile_path);
            state.config_files = a.config_files;
            state.tiltfile_args = a.user_args;
            state.analytics_user_opt = a.analytics_user_opt;
            state.engine_mode = a.engine_mode;
        }
        Action::Error { message } => {
            state.fatal_error = Some(message);
        }
        Action::BuildStarted(a) => apply_build_started(state, a),
        Action::BuildComplete(a) => apply_build_complete(state, a),
        Action::ConfigsReloadStarted(a) => {
            state.started_tiltfile_load_count += 1;
            state.config_reload_checkpoint = state.log_store.len();
            state.tiltfile_state.current_build = Some(crate::domain::build_result::BuildRecord::new(
                a.span_id,
                a.start_time,
                a.files_changed.iter().map(|p| p.display().to_string()).collect(),
                BuildReason::CONFIG_CHANGE,
            ));
        }
        Action::ConfigsReloaded(a) => apply_configs_reloaded(state, a),
        Action::K8sDiscovery(a) => {
            if let Some(manifest_state) = state.manifest_state_mut(&a.manifest_name) {
                let runtime = manifest_state
                    .runtime_state
                    .get_or_insert_with(|| RuntimeState::K8s(Box::default()));
                if let Some(k8s) = runtime.as_k8s_mut() {
                    podtracker::apply_pod_event(k8s, a.kind, a.pod);
                    if podtracker::needs_rebuild_from_crash(k8s, &manifest_state.live_updated_container_ids) {
                        manifest_state.needs_rebuild_from_crash = true;
                    }
                }
            }
        }
        Action::ServiceChange(a) => {
            if let Some(manifest_state) = state.manifest_state_mut(&a.manifest_name) {
                if let Some(k8s) = manifest_state
                    .runtime_state
                    .get_or_insert_with(|| RuntimeState::K8s(Box::default()))
                    .as_k8s_mut()
                {
                    k8s.lbs.insert(a.service_name, a.url);
                }
            }
        }
        Action::K8sEvent(a) => {
            let owner = state.manifest_states.iter().find_map(|(name, ms)| {
                ms.runtime_state
                    .as_ref()
                    .and_then(|rs| rs.as_k8s())
                    .filter(|k8s| k8s.deployed_entities.iter().any(|e| e.uid == a.involved_object_uid))
                    .map(|_| name.clone())
            });
            if let Some(name) = owner {
                state.log_store.append(Some(name), "k8s-event", a.level, vec![], a.message);
            }
        }
        Action::FileWatch(a) => {
            if a.kind == FileWatchKind::UpdateStatus {
                if let Some(manifest_state) = state.manifest_state_mut(&a.manifest_name) {
                    let status = manifest_state.status_for(&a.target_id);
                    for path in a.paths {
                        status.pending_file_changes.insert(path, a.time);
                    }
                }
            }
        }
        Action::AppendToTriggerQueue { name, reason } => {
            if !state.trigger_queue.contains(&name) {
                state.trigger_queue.push(name.clone());
            }
            if let Some(manifest_state) = state.manifest_state_mut(&name) {
                manifest_state.trigger_reason |= reason | BuildReason::TRIGGER_QUEUE;
            }
        }
        Action::OverrideTriggerMode { name, trigger_mode } => {
            if let Some(manifest) = state.manifests.get(&name) {
                let mut updated = (**manifest).clone();
                updated.trigger_mode = trigger_mode;
                state.manifests.insert(name, Arc::new(updated));
            } else {
                state.log_store.append(
                    None,
                    "trigger-mode-override",
                    crate::logstore::LogLevel::Error,
                    vec![],
                    format!("unknown manifest {name}"),
                );
            }
        }
        Action::SetTiltfileArgs { args } => {
            state.tiltfile_args = args;
        }
        Action::LogAction(a) => {
            state.log_store.append(a.manifest_name, a.span_id, a.level, a.fields, a.text);
        }
        Action::Panic { message } => {
            state.panic_exited = Some(message);
        }
        Action::HudExit { error } => match error {
            Some(e) => state.fatal_error = Some(e),
            None => state.user_exited = true,
        },
    }
    summary
}

fn apply_build_started(state: &mut EngineState, a: crate::store::actions::BuildStartedAction) {
    state.started_build_count += 1;
    state.currently_building.insert(a.name.clone());
    state.trigger_queue.retain(|n| n != &a.name);

    let is_tiltfile_build = !state.manifests.contains_key(&a.name);
    let history_limit = state.build_history_limit;
    let manifest_state = if is_tiltfile_build {
        &mut state.tiltfile_state
    } else {
        state
            .manifest_states
            .entry(a.name.clone())
            .or_insert_with(|| ManifestState::new(history_limit))
    };

    manifest_state.current_build = Some(crate::domain::build_result::BuildRecord::new(
        a.span_id,
        a.start_time,
        a.files_changed.iter().map(|p| p.display().to_string()).collect(),
        a.reason,
    ));

    if a.full_build_triggered {
        manifest_state.live_updated_container_ids.clear();
    }

    if let Some(RuntimeState::K8s(k8s)) = manifest_state.runtime_state.as_mut() {
        let known: Vec<String> = k8s.pods.keys().cloned().collect();
        for pod in &known {
            k8s.update_start_time.insert(pod.clone(), a.start_time);
        }
        k8s.update_start_time.retain(|pod, _| known.contains(pod));
    }
}

fn apply_build_complete(state: &mut EngineState, a: crate::store::actions::BuildCompleteAction) {
    state.completed_build_count += 1;
    state.currently_building.remove(&a.name);

    let is_tiltfile_build = !state.manifests.contains_key(&a.name);
    let history_limit = state.build_history_limit;
    let target_ids: Vec<_> = state
        .manifests
        .get(&a.name)
        .map(|m| m.all_target_ids())
        .unwrap_or_default();

    {
        let manifest_state = if is_tiltfile_build {
            &mut state.tiltfile_state
        } else {
            state
                .manifest_states
                .entry(a.name.clone())
                .or_insert_with(|| ManifestState::new(history_limit))
        };

        let mut record = manifest_state.current_build.take().unwrap_or_default();
        record.finish_time = Some(a.finish_time);
        record.error = a.error.as_ref().map(|e| e.message().to_string());
        record.build_types = a.build_types.clone();
        record.warning_count = a.warning_count;
        let start_time = record.start_time;
        manifest_state.push_history(record);

        for id in &target_ids {
            if let Some(result) = a.result.0.get(id) {
                manifest_state.status_for(id).last_result = Some(result.clone());
            }
        }
        manifest_state.clear_pending_changes_before(start_time);

        if a.result.has_live_update() {
            manifest_state
                .live_updated_container_ids
                .extend(a.result.live_updated_container_ids());
        } else {
            manifest_state.live_updated_container_ids.clear();
        }

        if a.error.is_none() {
            if let Some(crate::domain::build_result::BuildResult::K8sDeploy {
                deployed_entities,
                pod_template_spec_hashes,
                ..
            }) = a.result.deploy_result()
            {
                let k8s = manifest_state
                    .runtime_state
                    .get_or_insert_with(|| RuntimeState::K8s(Box::default()))
                    .as_k8s_mut()
                    .expect("just inserted k8s runtime state");
                k8s.has_ever_deployed_successfully = true;
                k8s.deployed_entities = deployed_entities.clone();
                k8s.deployed_pod_template_spec_hash_set = pod_template_spec_hashes.iter().cloned().collect();
                if !a.result.has_live_update() {
                    podtracker::stamp_baseline_restarts(k8s);
                }
            }

            if let Some(crate::domain::build_result::BuildResult::DockerComposeDeploy {
                container_id,
                container_state,
                ..
            }) = a.result.deploy_result()
            {
                let dc = manifest_state
                    .runtime_state
                    .get_or_insert_with(|| RuntimeState::DockerCompose(Default::default()))
                    .as_docker_compose_mut()
                    .expect("just inserted docker-compose runtime state");
                let first_start = dc.container_id.is_none();
                dc.container_id = Some(container_id.clone());
                dc.container_state = Some(container_state.clone());
                if first_start {
                    dc.start_time = Some(a.finish_time);
                    dc.last_ready_time = Some(a.finish_time);
                }
            }

            if let Some(crate::domain::build_result::BuildResult::Local { .. }) = a.result.deploy_result() {
                let local = manifest_state
                    .runtime_state
                    .get_or_insert_with(|| RuntimeState::Local(Default::default()))
                    .as_local_mut()
                    .expect("just inserted local runtime state");
                local.last_ready_or_succeeded_time = Some(a.finish_time);
            }

            manifest_state.last_successful_deploy_time = Some(a.finish_time);
        }

        if let Some(err) = &a.error {
            if err.fatal() {
                state.fatal_error = Some(err.message().to_string());
            }
        }
    }

    // Cross-manifest image reuse: propagate rebuilt image ids to every other
    // manifest that shares the image target.
    let updated_image_ids: Vec<_> = a
        .result
        .values()
        .filter_map(|r| match r {
            crate::domain::build_result::BuildResult::Image { id, .. } => Some(id.clone()),
            _ => None,
        })
        .collect();

    if !updated_image_ids.is_empty() {
        let dependents: Vec<(ManifestName, crate::domain::target::TargetID)> = state
            .manifests
            .iter()
            .filter(|(name, _)| **name != a.name)
            .flat_map(|(name, m)| {
                m.image_targets
                    .iter()
                    .filter(|t| t.id.kind == TargetKind::Image && updated_image_ids.contains(&t.id))
                    .map(|t| (name.clone(), t.id.clone()))
            })
            .collect();

        for (name, id) in dependents {
            if state.currently_building.contains(&name) {
                continue;
            }
            if let Some(manifest_state) = state.manifest_state_mut(&name) {
                manifest_state
                    .status_for(&id)
                    .pending_dependency_changes
                    .insert(id.clone(), a.finish_time);
            }
        }
    }
}

fn apply_configs_reloaded(state: &mut EngineState, a: crate::store::actions::ConfigsReloadedAction) {
    let mut record = state.tiltfile_state.current_build.take().unwrap_or_default();
    record.finish_time = Some(a.finish_time);
    record.error = a.error.clone();
    state.tiltfile_state.push_history(record);

    for (key, value) in a.features {
        state.features.insert(key, value);
    }

    if a.error.is_some() {
        // Partial-failure tolerance (spec.md §4.8): accept safe additions,
        // preserve every existing manifest.
        for f in a.config_files {
            if !state.config_files.contains(&f) {
                state.config_files.push(f);
            }
        }
        return;
    }

    state.config_files = a.config_files;
    state.tiltignore = a.tiltignore;
    state.watch_settings = a.watch_settings;
    state.secrets = a.secrets.clone();

    let new_names: std::collections::HashSet<ManifestName> = a.manifests.iter().map(|m| m.name.clone()).collect();

    // Drop manifest targets sourced from the configuration file that are
    // absent from the new list; keep everything else.
    state.manifest_definition_order.retain(|name| {
        let keep = new_names.contains(name)
            || state
                .manifests
                .get(name)
                .map(|m| m.source != crate::domain::manifest::ManifestSource::Tiltfile)
                .unwrap_or(false);
        if !keep {
            state.manifests.remove(name);
            state.manifest_states.remove(name);
        }
        keep
    });

    for manifest in a.manifests {
        let name = manifest.name.clone();
        let invalidated = state
            .manifests
            .get(&name)
            .map(|old| manifest.invalidates_build(old))
            .unwrap_or(false);

        if !state.manifest_definition_order.contains(&name) {
            state.manifest_definition_order.push(name.clone());
        }

        let manifest_state = state
            .manifest_states
            .entry(name.clone())
            .or_insert_with(|| ManifestState::new(state.build_history_limit));
        if invalidated {
            manifest_state.build_statuses.clear();
            manifest_state.pending_manifest_change = Some(a.finish_time);
        }

        state.manifests.insert(name, Arc::new(manifest));
    }

    let checkpoint = state.config_reload_checkpoint;
    state.log_store.scrub_secrets_starting_at(&state.secrets.clone(), checkpoint);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::build_result::{BuildResult, BuildResultSet};
    use crate::domain::manifest::{DeployTarget, Manifest, ManifestSource, TriggerMode};
    use crate::domain::target::TargetID;
    use crate::store::actions::{BuildCompleteAction, BuildStartedAction};
    use crate::store::state::{EngineMode, TerminalMode};
    use chrono::Utc;
    use std::collections::HashSet;

    fn k8s_manifest(name: &str) -> Manifest {
        Manifest {
            name: ManifestName::new(name),
            image_targets: vec![],
            deploy_target: DeployTarget::K8s {
                yaml: "kind: Deployment".into(),
                image_maps: vec![],
                is_stateful_set: false,
            },
            trigger_mode: TriggerMode::Auto,
            resource_dependencies: HashSet::new(),
            source: ManifestSource::Tiltfile,
        }
    }

    fn fresh_state() -> EngineState {
        EngineState::new(2, 10, 4, EngineMode::Up, TerminalMode::Hud)
    }

    #[test]
    fn build_started_then_complete_restores_current_build_to_empty() {
        let mut state = fresh_state();
        let manifest = k8s_manifest("foobar");
        let name = manifest.name.clone();
        state.manifest_definition_order.push(name.clone());
        state.manifests.insert(name.clone(), Arc::new(manifest));
        state
            .manifest_states
            .insert(name.clone(), ManifestState::new(10));

        reduce(
            &mut state,
            Action::BuildStarted(BuildStartedAction {
                name: name.clone(),
                files_changed: vec![],
                reason: BuildReason::INITIAL_BUILD,
                span_id: "span-1".into(),
                start_time: Utc::now(),
                full_build_triggered: false,
            }),
        );
        assert!(state.currently_building.contains(&name));
        assert!(state.manifest_state(&name).unwrap().is_building());

        let mut result = BuildResultSet::default();
        result.insert(BuildResult::K8sDeploy {
            id: TargetID::k8s("foobar"),
            deployed_entities: vec![],
            pod_template_spec_hashes: vec![],
        });
        reduce(
            &mut state,
            Action::BuildComplete(BuildCompleteAction {
                name: name.clone(),
                span_id: "span-1".into(),
                finish_time: Utc::now(),
                result,
                error: None,
                build_types: vec![],
                warning_count: 0,
            }),
        );

        assert!(!state.currently_building.contains(&name));
        assert!(!state.manifest_state(&name).unwrap().is_building());
        assert_eq!(state.completed_build_count, 1);
        assert!(state.manifest_state(&name).unwrap().runtime_state.as_ref().unwrap().as_k8s().unwrap().has_ever_deployed_successfully);
        state.check_invariants();
    }

    #[test]
    fn trigger_queue_never_has_duplicates() {
        let mut state = fresh_state();
        let name = ManifestName::new("foobar");
        reduce(
            &mut state,
            Action::AppendToTriggerQueue {
                name: name.clone(),
                reason: BuildReason::TRIGGER_QUEUE,
            },
        );
        reduce(
            &mut state,
            Action::AppendToTriggerQueue {
                name: name.clone(),
                reason: BuildReason::TRIGGER_QUEUE,
            },
        );
        assert_eq!(state.trigger_queue.iter().filter(|n| **n == name).count(), 1);
    }

    #[test]
    fn non_exit_actions_are_dropped_once_fatal_error_is_set() {
        let mut state = fresh_state();
        state.fatal_error = Some("boom".into());
        reduce(
            &mut state,
            Action::AppendToTriggerQueue {
                name: ManifestName::new("foobar"),
                reason: BuildReason::TRIGGER_QUEUE,
            },
        );
        assert!(state.trigger_queue.is_empty());
    }

    #[test]
    fn partial_failure_reload_preserves_existing_manifests() {
        let mut state = fresh_state();
        for n in ["m1", "m2"] {
            let manifest = k8s_manifest(n);
            state.manifest_definition_order.push(manifest.name.clone());
            state.manifest_states.insert(manifest.name.clone(), ManifestState::new(10));
            state.manifests.insert(manifest.name.clone(), Arc::new(manifest));
        }

        reduce(
            &mut state,
            Action::ConfigsReloaded(crate::store::actions::ConfigsReloadedAction {
                manifests: vec![],
                features: [("x".to_string(), true)].into_iter().collect(),
                secrets: vec![],
                tiltignore: vec![],
                watch_settings: Default::default(),
                config_files: vec![],
                finish_time: Utc::now(),
                error: Some("syntax error".into()),
            }),
        );

        assert_eq!(state.manifests.len(), 2);
        assert_eq!(state.features.get("x"), Some(&true));
        assert!(state.tiltfile_state.build_history[0].error.is_some());
    }
}
