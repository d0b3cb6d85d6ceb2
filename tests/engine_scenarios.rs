//! End-to-end seed scenarios (S1-S6) against a real Store with fake
//! `BuildAndDeployer`/`ClusterClient` implementations.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use devloop_core::buildcontrol::{build_and_deploy, next_target_to_build, pending_files_for, ClusterClient, HoldReason, ImageBuilder, NeverReuse};
use devloop_core::domain::build_result::{BuildReason, BuildResult, BuildResultSet, BuildState, ObjectRef};
use devloop_core::domain::error::BuildError;
use devloop_core::domain::manifest::{BuildDetails, DeployTarget, ImageRefs, ImageTarget, Manifest, ManifestSource, TriggerMode};
use devloop_core::domain::runtime::{Pod, PodAttachment, RuntimeState};
use devloop_core::domain::target::{ManifestName, TargetID};
use devloop_core::podtracker::PodEventKind;
use devloop_core::store::{
    Action, BuildCompleteAction, BuildStartedAction, ConfigsReloadedAction, EngineMode, EngineState, Store, TerminalMode,
    WatchSettings,
};

struct FakeBuilder;
#[async_trait]
impl ImageBuilder for FakeBuilder {
    async fn build_image(
        &self,
        target_id: &TargetID,
        _refs: &ImageRefs,
        _details: &BuildDetails,
    ) -> Result<BuildResult, BuildError> {
        Ok(BuildResult::Image {
            id: target_id.clone(),
            local_ref: format!("{}:dev", target_id.name),
            cluster_ref: format!("{}:dev", target_id.name),
        })
    }
}

struct FakeCluster {
    uid: String,
}
#[async_trait]
impl ClusterClient for FakeCluster {
    async fn upsert(&self, _yaml: &str, _timeout: Duration) -> Result<Vec<ObjectRef>, BuildError> {
        Ok(vec![ObjectRef {
            uid: self.uid.clone(),
            name: "demo".into(),
            namespace: "default".into(),
            kind: "Deployment".into(),
        }])
    }
    async fn delete(&self, _entities: &[ObjectRef]) -> Result<(), BuildError> {
        Ok(())
    }
    async fn local_registry(&self) -> Option<String> {
        None
    }
}

fn k8s_manifest(name: &str, image_targets: Vec<ImageTarget>, image_maps: Vec<TargetID>) -> Manifest {
    Manifest {
        name: ManifestName::new(name),
        image_targets,
        deploy_target: DeployTarget::K8s {
            yaml: format!("kind: Deployment\nname: {name}"),
            image_maps,
            is_stateful_set: false,
        },
        trigger_mode: TriggerMode::Auto,
        resource_dependencies: HashSet::new(),
        source: ManifestSource::Tiltfile,
    }
}

fn image_target(name: &str) -> ImageTarget {
    ImageTarget {
        id: TargetID::image(name),
        refs: ImageRefs {
            configuration_ref: name.to_string(),
            local_ref: None,
            cluster_ref: None,
        },
        build_details: BuildDetails::Docker {
            dockerfile: "Dockerfile".into(),
            context: ".".into(),
            build_args: vec![],
        },
        dockerignores: vec![],
        live_update: None,
        dependency_ids: vec![],
    }
}

fn fresh_store(max_parallel: usize) -> Store {
    let state = EngineState::new(max_parallel, 10, 4, EngineMode::Up, TerminalMode::Hud);
    Store::new(state, Duration::from_millis(1))
}

async fn reload(store: &Store, manifests: Vec<Manifest>) {
    store.dispatch(Action::ConfigsReloaded(ConfigsReloadedAction {
        manifests,
        features: HashMap::new(),
        secrets: vec![],
        tiltignore: vec![],
        watch_settings: WatchSettings::default(),
        config_files: vec![],
        finish_time: Utc::now(),
        error: None,
    }));
    tokio::time::sleep(Duration::from_millis(20)).await;
}

async fn run_build(store: &Store, name: &ManifestName, reason: BuildReason, uid: &str) {
    let manifest = store.read().await.manifest(name).unwrap().clone();
    let span_id = format!("span-{name}");
    let start_time = Utc::now();
    let files_changed = pending_files_for(&*store.read().await, name);
    store.dispatch(Action::BuildStarted(BuildStartedAction {
        name: name.clone(),
        files_changed,
        reason,
        span_id: span_id.clone(),
        start_time,
        full_build_triggered: false,
    }));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let result = build_and_deploy(
        &manifest,
        &HashMap::<TargetID, BuildState>::new(),
        &FakeBuilder,
        &FakeCluster { uid: uid.to_string() },
        &NeverReuse,
        false,
        &span_id,
    )
    .await
    .unwrap();

    store.dispatch(Action::BuildComplete(BuildCompleteAction {
        name: name.clone(),
        span_id,
        finish_time: Utc::now(),
        result,
        error: None,
        build_types: vec!["docker".into()],
        warning_count: 0,
    }));
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test]
async fn s1_happy_path() {
    let store = fresh_store(1);
    let name = ManifestName::new("foobar");
    reload(&store, vec![k8s_manifest("foobar", vec![image_target("foobar-img")], vec![TargetID::image("foobar-img")])]).await;

    run_build(&store, &name, BuildReason::INITIAL_BUILD, "u1").await;

    let read = store.read().await;
    assert_eq!(read.completed_build_count, 1);
    let ms = read.manifest_state(&name).unwrap();
    assert!(ms
        .runtime_state
        .as_ref()
        .and_then(RuntimeState::as_k8s)
        .unwrap()
        .has_ever_deployed_successfully);
    assert!(ms.build_history[0].error.is_none());
}

#[tokio::test]
async fn s2_file_change_rebuild_with_history_growth() {
    let store = fresh_store(1);
    let name = ManifestName::new("foobar");
    reload(&store, vec![k8s_manifest("foobar", vec![image_target("foobar-img")], vec![TargetID::image("foobar-img")])]).await;
    run_build(&store, &name, BuildReason::INITIAL_BUILD, "u1").await;

    store.dispatch(Action::FileWatch(devloop_core::store::FileWatchAction {
        kind: devloop_core::store::FileWatchKind::UpdateStatus,
        manifest_name: name.clone(),
        target_id: TargetID::image("foobar-img"),
        paths: vec!["a.go".into()],
        time: Utc::now(),
    }));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let next = {
        let state = store.read().await;
        next_target_to_build(&state)
    };
    assert_eq!(next.name, Some(name.clone()));

    run_build(&store, &name, next.reason, "u1").await;

    let read = store.read().await;
    let ms = read.manifest_state(&name).unwrap();
    assert_eq!(ms.build_history.len(), 2);
    assert_eq!(ms.build_history[0].edits, vec!["a.go".to_string()]);
}

#[tokio::test]
async fn s3_cross_manifest_image_reuse_propagates() {
    let store = fresh_store(2);
    let common = image_target("common-img");
    reload(
        &store,
        vec![
            k8s_manifest("m1", vec![common.clone()], vec![TargetID::image("common-img")]),
            k8s_manifest("m2", vec![common], vec![TargetID::image("common-img")]),
        ],
    )
    .await;

    let m1 = ManifestName::new("m1");
    let m2 = ManifestName::new("m2");
    run_build(&store, &m1, BuildReason::INITIAL_BUILD, "u1").await;

    {
        let read = store.read().await;
        let m2_state = read.manifest_state(&m2).unwrap();
        assert!(m2_state
            .build_statuses
            .get(&TargetID::image("common-img"))
            .map(|s| !s.pending_dependency_changes.is_empty())
            .unwrap_or(false));
    }

    let next = {
        let state = store.read().await;
        next_target_to_build(&state)
    };
    assert_eq!(next.name, Some(m2));
}

#[tokio::test]
async fn s4_crash_rebuild() {
    let store = fresh_store(1);
    let name = ManifestName::new("foobar");
    let mut live_update_target = image_target("foobar-img");
    live_update_target.live_update = Some(devloop_core::domain::manifest::LiveUpdateSpec::default());
    reload(&store, vec![k8s_manifest("foobar", vec![live_update_target], vec![TargetID::image("foobar-img")])]).await;
    run_build(&store, &name, BuildReason::INITIAL_BUILD, "u1").await;

    {
        let mut result = BuildResultSet::default();
        result.insert(BuildResult::LiveUpdate {
            id: TargetID::image("foobar-img"),
            container_ids: vec!["c1".into()],
        });
        store.dispatch(Action::BuildStarted(BuildStartedAction {
            name: name.clone(),
            files_changed: vec![],
            reason: BuildReason::CHANGED_FILES,
            span_id: "span-lu".into(),
            start_time: Utc::now(),
            full_build_triggered: false,
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.dispatch(Action::BuildComplete(BuildCompleteAction {
            name: name.clone(),
            span_id: "span-lu".into(),
            finish_time: Utc::now(),
            result,
            error: None,
            build_types: vec!["live_update".into()],
            warning_count: 0,
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let pod = Pod {
        name: "p1".into(),
        ancestor_uid: "u1".into(),
        pod_template_spec_hash: "anything".into(),
        resource_version: 2,
        creation_time: Utc::now(),
        container_ids: vec!["c2".into()],
        restart_count: 0,
        phase: "Running".into(),
        attachment: PodAttachment::Unknown,
    };
    store.dispatch(Action::K8sDiscovery(devloop_core::store::K8sDiscoveryAction {
        kind: PodEventKind::Create,
        manifest_name: name.clone(),
        pod,
    }));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let read = store.read().await;
    assert!(read.manifest_state(&name).unwrap().needs_rebuild_from_crash);

    let next = next_target_to_build(&read);
    assert_eq!(next.name, Some(name.clone()));
    assert!(next.reason.contains(BuildReason::CRASH));
}

#[tokio::test]
async fn s5_partial_failure_reload_preserves_manifests() {
    let store = fresh_store(1);
    reload(&store, vec![k8s_manifest("m1", vec![], vec![]), k8s_manifest("m2", vec![], vec![])]).await;

    store.dispatch(Action::ConfigsReloaded(ConfigsReloadedAction {
        manifests: vec![],
        features: [("x".to_string(), true)].into_iter().collect(),
        secrets: vec![],
        tiltignore: vec![],
        watch_settings: WatchSettings::default(),
        config_files: vec![],
        finish_time: Utc::now(),
        error: Some("syntax error".into()),
    }));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let read = store.read().await;
    assert_eq!(read.manifests.len(), 2);
    assert_eq!(read.features.get("x"), Some(&true));
    assert!(read.tiltfile_state.build_history[0].error.is_some());
}

#[tokio::test]
async fn s6_parallel_cap_holds_the_third_manifest() {
    let store = fresh_store(2);
    reload(
        &store,
        vec![
            k8s_manifest("m1", vec![], vec![]),
            k8s_manifest("m2", vec![], vec![]),
            k8s_manifest("m3", vec![], vec![]),
        ],
    )
    .await;

    for n in ["m1", "m2"] {
        store.dispatch(Action::BuildStarted(BuildStartedAction {
            name: ManifestName::new(n),
            files_changed: vec![],
            reason: BuildReason::INITIAL_BUILD,
            span_id: format!("span-{n}"),
            start_time: Utc::now(),
            full_build_triggered: false,
        }));
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    let next = {
        let state = store.read().await;
        next_target_to_build(&state)
    };
    assert_eq!(next.name, None);
    assert_eq!(
        next.holds.get(&ManifestName::new("m3")),
        Some(&HoldReason::NoParallelSlots)
    );
}
