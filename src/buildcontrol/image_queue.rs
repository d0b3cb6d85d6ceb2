//! Topologically builds image targets, reusing cached results where valid
//! (spec.md §4.5).

use std::collections::HashMap;
use std::future::Future;

use crate::domain::build_result::{BuildResult, BuildState};
use crate::domain::error::BuildError;
use crate::domain::manifest::ImageTarget;
use crate::domain::target::TargetID;

/// External probe (registry existence check) deciding whether a previously
/// built image ref can still be reused; a thin wrapper so `ImageTargetQueue`
/// stays free of registry I/O (spec.md §6 external-interfaces split).
pub trait ImageReuseProbe: Send + Sync {
    fn can_reuse_ref(&self, target_id: &TargetID, local_ref: &str) -> bool;
}

/// A probe that always says no — conservative default, forces a rebuild.
pub struct NeverReuse;
impl ImageReuseProbe for NeverReuse {
    fn can_reuse_ref(&self, _target_id: &TargetID, _local_ref: &str) -> bool {
        false
    }
}

fn topological_order(targets: &[ImageTarget]) -> Vec<ImageTarget> {
    let mut remaining: Vec<ImageTarget> = targets.to_vec();
    let mut ordered = Vec::with_capacity(targets.len());
    let mut placed: std::collections::HashSet<TargetID> = std::collections::HashSet::new();

    while !remaining.is_empty() {
        let idx = remaining
            .iter()
            .position(|t| t.dependency_ids.iter().all(|d| placed.contains(d)))
            .unwrap_or(0);
        let next = remaining.remove(idx);
        placed.insert(next.id.clone());
        ordered.push(next);
    }
    ordered
}

fn should_reuse(state: &BuildState, probe: &dyn ImageReuseProbe, target: &ImageTarget) -> bool {
    let Some(BuildResult::Image { local_ref, .. }) = &state.last_successful_result else {
        return false;
    };
    if !state.files_changed_set.is_empty() || !state.deps_changed_set.is_empty() || state.image_build_triggered {
        return false;
    }
    probe.can_reuse_ref(&target.id, local_ref)
}

/// Drives one manifest's image targets through reuse-or-rebuild, in
/// dependency order.
pub struct ImageTargetQueue {
    order: Vec<ImageTarget>,
    reused: HashMap<TargetID, BuildResult>,
    new_results: HashMap<TargetID, BuildResult>,
    dep_results: HashMap<TargetID, BuildResult>,
    failure: Option<BuildError>,
}

impl ImageTargetQueue {
    pub fn new(
        targets: &[ImageTarget],
        build_states: &HashMap<TargetID, BuildState>,
        probe: &dyn ImageReuseProbe,
    ) -> Self {
        let order = topological_order(targets);
        let mut reused = HashMap::new();
        let mut dep_results = HashMap::new();

        for target in &order {
            let state = build_states.get(&target.id).cloned().unwrap_or_default();
            if should_reuse(&state, probe, target) {
                if let Some(result) = state.last_successful_result.clone() {
                    dep_results.insert(target.id.clone(), result.clone());
                    reused.insert(target.id.clone(), result);
                }
            }
        }

        Self {
            order,
            reused,
            new_results: HashMap::new(),
            dep_results,
            failure: None,
        }
    }

    pub fn reused_results(&self) -> &HashMap<TargetID, BuildResult> {
        &self.reused
    }

    pub fn new_results(&self) -> &HashMap<TargetID, BuildResult> {
        &self.new_results
    }

    pub fn count_builds(&self) -> usize {
        self.order.len() - self.reused.len()
    }

    pub fn failure(&self) -> Option<&BuildError> {
        self.failure.as_ref()
    }

    /// Invokes `f` for every target not being reused, in topological order,
    /// threading updated dependency results into downstream calls. The
    /// first error aborts further builds; results already produced are kept.
    ///
    /// `f` receives owned copies of the target and the dependency results
    /// gathered so far, rather than references, so its returned future isn't
    /// tied to a borrow of `self`.
    pub async fn run_builds<F, Fut>(&mut self, mut f: F) -> Result<(), BuildError>
    where
        F: FnMut(ImageTarget, HashMap<TargetID, BuildResult>) -> Fut,
        Fut: Future<Output = Result<BuildResult, BuildError>>,
    {
        let order = self.order.clone();
        for target in &order {
            if self.reused.contains_key(&target.id) {
                continue;
            }
            match f(target.clone(), self.dep_results.clone()).await {
                Ok(result) => {
                    self.dep_results.insert(target.id.clone(), result.clone());
                    self.new_results.insert(target.id.clone(), result);
                }
                Err(e) => {
                    self.failure = Some(e.clone());
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::manifest::BuildDetails;

    fn image_target(name: &str, deps: Vec<TargetID>) -> ImageTarget {
        ImageTarget {
            id: TargetID::image(name),
            refs: crate::domain::manifest::ImageRefs {
                configuration_ref: format!("{name}:latest"),
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
            dependency_ids: deps,
        }
    }

    #[tokio::test]
    async fn builds_in_dependency_order() {
        let base = image_target("base", vec![]);
        let app = image_target("app", vec![base.id.clone()]);
        let targets = vec![app.clone(), base.clone()];
        let mut queue = ImageTargetQueue::new(&targets, &HashMap::new(), &NeverReuse);

        let mut built_order = Vec::new();
        queue
            .run_builds(|target, _deps| {
                built_order.push(target.id.name.clone());
                std::future::ready(Ok(BuildResult::Image {
                    id: target.id.clone(),
                    local_ref: format!("{}:abc", target.id.name),
                    cluster_ref: format!("{}:abc", target.id.name),
                }))
            })
            .await
            .unwrap();

        assert_eq!(built_order, vec!["base".to_string(), "app".to_string()]);
        assert_eq!(queue.new_results().len(), 2);
    }

    #[tokio::test]
    async fn first_failure_aborts_remaining_builds() {
        let a = image_target("a", vec![]);
        let b = image_target("b", vec![]);
        let targets = vec![a, b];
        let mut queue = ImageTargetQueue::new(&targets, &HashMap::new(), &NeverReuse);

        let mut calls = 0;
        let result = queue
            .run_builds(|target, _deps| {
                calls += 1;
                let failing = target.id.name == "a";
                std::future::ready(if failing {
                    Err(BuildError::Transient("boom".into()))
                } else {
                    Ok(BuildResult::Image {
                        id: target.id.clone(),
                        local_ref: "b:abc".into(),
                        cluster_ref: "b:abc".into(),
                    })
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls, 1);
        assert!(queue.new_results().is_empty());
    }
}
