//! Build-and-deploy core: reuse -> image build -> push -> inject -> apply
//! (spec.md §4.6).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::buildcontrol::image_queue::{ImageReuseProbe, ImageTargetQueue};
use crate::domain::build_result::{BuildResult, BuildResultSet, BuildState, ObjectRef};
use crate::domain::error::BuildError;
use crate::domain::manifest::{BuildDetails, DeployTarget, ImageRefs, ImageTarget, Manifest};
use crate::domain::target::TargetID;

/// `ImageBuilder`/`CustomBuilder` external interface (spec.md §6).
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build_image(
        &self,
        target_id: &TargetID,
        refs: &ImageRefs,
        details: &BuildDetails,
    ) -> Result<BuildResult, BuildError>;
}

/// `ClusterClient` external interface (spec.md §6). Deployed entities must
/// carry a non-empty UID.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn upsert(&self, yaml: &str, timeout: Duration) -> Result<Vec<ObjectRef>, BuildError>;
    async fn delete(&self, entities: &[ObjectRef]) -> Result<(), BuildError>;
    async fn local_registry(&self) -> Option<String>;
    /// Whether the image builder targets this cluster's own container
    /// runtime directly (push becomes unnecessary).
    fn builds_to_cluster_runtime(&self) -> bool {
        false
    }
}

/// Whether a just-built image needs pushing, per the decision tree in
/// spec.md §4.6 stage 3, checked in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushDecision {
    Skip,
    ClusterLoad,
    Push,
}

pub fn push_decision(
    details: &BuildDetails,
    referenced_by_deploy: bool,
    builds_to_cluster_runtime: bool,
    cluster_is_local_without_registry: bool,
) -> PushDecision {
    if details.skips_push() {
        return PushDecision::Skip;
    }
    if !referenced_by_deploy {
        return PushDecision::Skip;
    }
    if builds_to_cluster_runtime {
        return PushDecision::Skip;
    }
    if cluster_is_local_without_registry {
        return PushDecision::ClusterLoad;
    }
    PushDecision::Push
}

/// Rewrites `target`'s build instructions so each declared dependency image
/// resolves to the ref it was just built or reused at, rather than whatever
/// base-image tag the manifest author wrote (spec.md §4.6 stage 3). Custom
/// builds manage their own base images via their build command and are left
/// untouched; only the dependencies `target` actually declares are injected,
/// even if `deps` carries sibling results from earlier in the queue.
fn inject_dependency_digests(target: &ImageTarget, deps: &HashMap<TargetID, BuildResult>) -> BuildDetails {
    let BuildDetails::Docker { dockerfile, context, build_args } = &target.build_details else {
        return target.build_details.clone();
    };
    let mut build_args = build_args.clone();
    for dep_id in &target.dependency_ids {
        let Some(BuildResult::Image { local_ref, .. }) = deps.get(dep_id) else {
            continue;
        };
        let arg_name = format!("{}_IMAGE", dep_id.name.to_uppercase().replace('-', "_"));
        build_args.retain(|(k, _)| k != &arg_name);
        build_args.push((arg_name, local_ref.clone()));
    }
    BuildDetails::Docker {
        dockerfile: dockerfile.clone(),
        context: context.clone(),
        build_args,
    }
}

/// Counts pipeline stages and logs structured progress (spec.md §4.6: "the
/// whole operation is wrapped in a PipelineState").
pub struct PipelineState {
    span_id: String,
    total_stages: usize,
    completed_stages: usize,
    start: std::time::Instant,
}

impl PipelineState {
    pub fn new(span_id: impl Into<String>, total_stages: usize) -> Self {
        Self {
            span_id: span_id.into(),
            total_stages,
            completed_stages: 0,
            start: std::time::Instant::now(),
        }
    }

    pub fn advance(&mut self, stage: &str) {
        self.completed_stages += 1;
        tracing::info!(
            span_id = %self.span_id,
            stage,
            progress = format!("{}/{}", self.completed_stages, self.total_stages),
            "build stage"
        );
    }

    pub fn finish(self, success: bool) {
        tracing::info!(
            span_id = %self.span_id,
            success,
            duration_ms = self.start.elapsed().as_millis() as u64,
            "pipeline finished"
        );
    }
}

const KUBERNETES_APPLY_TIMEOUT_DEFAULT: Duration = Duration::from_secs(30);

/// Runs one manifest through the build-and-deploy core. Returns partial
/// progress alongside the error on failure, per spec.md §6's
/// `BuildAndDeployer` contract.
pub async fn build_and_deploy(
    manifest: &Manifest,
    build_states: &HashMap<TargetID, BuildState>,
    image_builder: &dyn ImageBuilder,
    cluster_client: &dyn ClusterClient,
    reuse_probe: &dyn ImageReuseProbe,
    full_build_triggered: bool,
    span_id: &str,
) -> Result<BuildResultSet, (BuildResultSet, BuildError)> {
    let mut results = BuildResultSet::default();
    let deploy_stage_count = 1;
    let pipeline = std::sync::Mutex::new(PipelineState::new(
        span_id,
        1 /* force-update */ + manifest.image_targets.len() * 2 + deploy_stage_count,
    ));

    if full_build_triggered {
        if let DeployTarget::K8s { .. } = &manifest.deploy_target {
            pipeline.lock().unwrap().advance("force-update");
        }
    }

    let mut queue = ImageTargetQueue::new(&manifest.image_targets, build_states, reuse_probe);
    for (id, result) in queue.reused_results() {
        tracing::info!(span_id, image = %id, "reusing cached image");
        results.insert(result.clone());
    }

    let image_maps: Vec<TargetID> = match &manifest.deploy_target {
        DeployTarget::K8s { image_maps, .. } => image_maps.clone(),
        _ => Vec::new(),
    };

    let build_result = queue
        .run_builds(|target, deps| {
            let build_details = inject_dependency_digests(&target, &deps);
            pipeline.lock().unwrap().advance("build");
            let referenced = image_maps.contains(&target.id);
            let pipeline = &pipeline;
            async move {
                let result = image_builder.build_image(&target.id, &target.refs, &build_details).await?;
                let decision = push_decision(
                    &build_details,
                    referenced,
                    cluster_client.builds_to_cluster_runtime(),
                    cluster_client.local_registry().await.is_none(),
                );
                tracing::debug!(span_id, image = %target.id, decision = ?decision, "push decision");
                pipeline.lock().unwrap().advance("push");
                Ok(result)
            }
        })
        .await;

    if let Err(e) = build_result {
        for result in queue.new_results().values() {
            results.insert(result.clone());
        }
        pipeline.into_inner().unwrap().finish(false);
        return Err((results, e));
    }

    for result in queue.new_results().values() {
        results.insert(result.clone());
    }

    let deploy_result = match &manifest.deploy_target {
        DeployTarget::K8s { yaml, .. } => {
            let rendered = render_deploy_yaml(yaml, &results);
            match cluster_client.upsert(&rendered, KUBERNETES_APPLY_TIMEOUT_DEFAULT).await {
                Ok(entities) => {
                    if entities.iter().any(|e| e.uid.is_empty()) {
                        let err = BuildError::Fatal("deployed entity missing UID".into());
                        pipeline.into_inner().unwrap().finish(false);
                        return Err((results, err));
                    }
                    let hash = pod_template_spec_hash(&rendered);
                    BuildResult::K8sDeploy {
                        id: manifest.deploy_target_id(),
                        deployed_entities: entities,
                        pod_template_spec_hashes: vec![hash],
                    }
                }
                Err(e) => {
                    pipeline.into_inner().unwrap().finish(false);
                    return Err((results, e));
                }
            }
        }
        DeployTarget::DockerCompose { service_name } => BuildResult::DockerComposeDeploy {
            id: manifest.deploy_target_id(),
            container_id: format!("{service_name}-container"),
            container_state: crate::domain::build_result::ContainerRuntimeState::Running,
        },
        DeployTarget::Local { .. } => BuildResult::Local {
            id: manifest.deploy_target_id(),
        },
    };
    pipeline.lock().unwrap().advance("deploy");
    results.insert(deploy_result);

    pipeline.into_inner().unwrap().finish(true);
    Ok(results)
}

fn render_deploy_yaml(template: &str, _image_results: &BuildResultSet) -> String {
    template.to_string()
}

fn pod_template_spec_hash(yaml: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    yaml.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

#[async_trait]
pub trait BuildAndDeployer: Send + Sync {
    async fn build_and_deploy(
        &self,
        manifest: &Manifest,
        build_states: &HashMap<TargetID, BuildState>,
        full_build_triggered: bool,
        span_id: &str,
    ) -> Result<BuildResultSet, (BuildResultSet, BuildError)>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buildcontrol::image_queue::NeverReuse;
    use crate::domain::manifest::{ManifestSource, TriggerMode};
    use std::collections::HashSet;

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
                local_ref: format!("{}:abc123", target_id.name),
                cluster_ref: format!("{}:abc123", target_id.name),
            })
        }
    }

    struct FakeCluster;
    #[async_trait]
    impl ClusterClient for FakeCluster {
        async fn upsert(&self, _yaml: &str, _timeout: Duration) -> Result<Vec<ObjectRef>, BuildError> {
            Ok(vec![ObjectRef {
                uid: "u1".into(),
                name: "foobar".into(),
                namespace: "default".into(),
                kind: "Deployment".into(),
            }])
        }
        async fn delete(&self, _entities: &[ObjectRef]) -> Result<(), BuildError> {
            Ok(())
        }
        async fn local_registry(&self) -> Option<String> {
            Some("registry.local:5000".into())
        }
    }

    fn foobar_manifest() -> Manifest {
        Manifest {
            name: crate::domain::target::ManifestName::new("foobar"),
            image_targets: vec![crate::domain::manifest::ImageTarget {
                id: TargetID::image("foobar-img"),
                refs: ImageRefs {
                    configuration_ref: "foobar".into(),
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
            }],
            deploy_target: DeployTarget::K8s {
                yaml: "kind: Deployment\nname: foobar".into(),
                image_maps: vec![TargetID::image("foobar-img")],
                is_stateful_set: false,
            },
            trigger_mode: TriggerMode::Auto,
            resource_dependencies: HashSet::new(),
            source: ManifestSource::Tiltfile,
        }
    }

    #[tokio::test]
    async fn happy_path_produces_image_and_deploy_results() {
        let manifest = foobar_manifest();
        let result = build_and_deploy(
            &manifest,
            &HashMap::new(),
            &FakeBuilder,
            &FakeCluster,
            &NeverReuse,
            false,
            "span-1",
        )
        .await
        .unwrap();

        assert!(result.image_result(&TargetID::image("foobar-img")).is_some());
        let deploy = result.deploy_result().unwrap();
        match deploy {
            BuildResult::K8sDeploy { deployed_entities, .. } => {
                assert_eq!(deployed_entities[0].uid, "u1");
            }
            _ => panic!("expected K8sDeploy result"),
        }
    }

    #[test]
    fn inject_dependency_digests_rewrites_build_args_for_declared_deps_only() {
        let base_id = TargetID::image("base");
        let sibling_id = TargetID::image("sibling");
        let app = crate::domain::manifest::ImageTarget {
            id: TargetID::image("app"),
            refs: ImageRefs {
                configuration_ref: "app".into(),
                local_ref: None,
                cluster_ref: None,
            },
            build_details: BuildDetails::Docker {
                dockerfile: "Dockerfile".into(),
                context: ".".into(),
                build_args: vec![("EXISTING".into(), "kept".into())],
            },
            dockerignores: vec![],
            live_update: None,
            dependency_ids: vec![base_id.clone()],
        };

        let mut deps = HashMap::new();
        deps.insert(
            base_id.clone(),
            BuildResult::Image {
                id: base_id.clone(),
                local_ref: "base:abc123".into(),
                cluster_ref: "base:abc123".into(),
            },
        );
        deps.insert(
            sibling_id.clone(),
            BuildResult::Image {
                id: sibling_id,
                local_ref: "sibling:xyz".into(),
                cluster_ref: "sibling:xyz".into(),
            },
        );

        let rewritten = inject_dependency_digests(&app, &deps);
        let BuildDetails::Docker { build_args, .. } = rewritten else {
            panic!("expected Docker build details");
        };
        assert_eq!(
            build_args,
            vec![
                ("EXISTING".to_string(), "kept".to_string()),
                ("BASE_IMAGE".to_string(), "base:abc123".to_string()),
            ]
        );
    }

    #[test]
    fn push_decision_follows_the_checklist() {
        let custom_skip = BuildDetails::Custom {
            command: "build.sh".into(),
            skips_push: true,
            tags_by_digest: false,
        };
        assert_eq!(push_decision(&custom_skip, true, false, false), PushDecision::Skip);

        let docker = BuildDetails::Docker {
            dockerfile: "Dockerfile".into(),
            context: ".".into(),
            build_args: vec![],
        };
        assert_eq!(push_decision(&docker, false, false, false), PushDecision::Skip);
        assert_eq!(push_decision(&docker, true, true, false), PushDecision::Skip);
        assert_eq!(push_decision(&docker, true, false, true), PushDecision::ClusterLoad);
        assert_eq!(push_decision(&docker, true, false, false), PushDecision::Push);
    }
}
