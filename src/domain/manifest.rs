//! Manifest: the immutable, per-reload-cycle description of one resource

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::target::{ManifestName, TargetID};

/// Where a live-update spec tells the builder to sync files from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncRef {
    Configuration,
    Local,
    Cluster,
}

/// A live-update spec: sync local paths into a running container instead of
/// rebuilding its image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveUpdateSpec {
    pub sync_paths: Vec<PathBuf>,
    pub run_commands: Vec<String>,
}

/// How an image target is actually built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildDetails {
    Docker {
        dockerfile: PathBuf,
        context: PathBuf,
        build_args: Vec<(String, String)>,
    },
    Custom {
        command: String,
        skips_push: bool,
        tags_by_digest: bool,
    },
}

impl BuildDetails {
    pub fn skips_push(&self) -> bool {
        matches!(self, BuildDetails::Custom { skips_push: true, .. })
    }
}

/// One image this manifest may need built, pushed, and/or live-updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageTarget {
    pub id: TargetID,
    pub refs: ImageRefs,
    pub build_details: BuildDetails,
    pub dockerignores: Vec<PathBuf>,
    pub live_update: Option<LiveUpdateSpec>,
    /// Other image targets this one's build instructions reference (e.g. as a
    /// base image) — drives the topological order in `ImageTargetQueue`.
    pub dependency_ids: Vec<TargetID>,
}

/// The three image-reference spellings an image can be known by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRefs {
    pub configuration_ref: String,
    pub local_ref: Option<String>,
    pub cluster_ref: Option<String>,
}

/// Where/how the manifest's built artifacts are actually deployed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeployTarget {
    K8s {
        yaml: String,
        image_maps: Vec<TargetID>,
        is_stateful_set: bool,
    },
    DockerCompose {
        service_name: String,
    },
    Local {
        serve_command: Option<String>,
        readiness_probe: bool,
    },
}

/// Controls whether a manifest rebuilds automatically on change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    Auto,
    Manual,
    ManualWithAutoInitial,
    AutoWithManualInitial,
}

impl TriggerMode {
    /// Whether this mode auto-builds the very first time, regardless of
    /// whether subsequent builds require a manual trigger.
    pub fn auto_initial(&self) -> bool {
        matches!(self, TriggerMode::Auto | TriggerMode::ManualWithAutoInitial)
    }

    /// Whether file/dependency changes alone (without an explicit trigger)
    /// are allowed to queue a *non-initial* build.
    pub fn auto_on_change(&self) -> bool {
        matches!(self, TriggerMode::Auto | TriggerMode::AutoWithManualInitial)
    }
}

/// Where a manifest came from; only `Tiltfile`-sourced manifests are dropped
/// on a reload that omits them (spec.md §3 lifecycle rule).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifestSource {
    Tiltfile,
    Metrics,
    Other(String),
}

/// Immutable value describing one resource for the current reload cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: ManifestName,
    pub image_targets: Vec<ImageTarget>,
    pub deploy_target: DeployTarget,
    pub trigger_mode: TriggerMode,
    pub resource_dependencies: HashSet<ManifestName>,
    pub source: ManifestSource,
}

impl Manifest {
    pub fn image_target_ids(&self) -> Vec<TargetID> {
        self.image_targets.iter().map(|t| t.id.clone()).collect()
    }

    /// All `TargetID`s this manifest's build status needs to track, in the
    /// order the build-and-deploy pipeline stages them: image targets first,
    /// then the deploy target itself.
    pub fn all_target_ids(&self) -> Vec<TargetID> {
        let mut ids = self.image_target_ids();
        ids.push(self.deploy_target_id());
        ids
    }

    /// Whether replacing `old` with `self` invalidates in-flight build
    /// bookkeeping (spec.md §4.8's `ChangesInvalidateBuild`).
    pub fn invalidates_build(&self, old: &Manifest) -> bool {
        self.image_targets != old.image_targets || self.deploy_target != old.deploy_target
    }

    pub fn deploy_target_id(&self) -> TargetID {
        use super::target::TargetKind;
        match &self.deploy_target {
            DeployTarget::K8s { .. } => TargetID::new(TargetKind::K8s, self.name.as_str()),
            DeployTarget::DockerCompose { .. } => {
                TargetID::new(TargetKind::DockerCompose, self.name.as_str())
            }
            DeployTarget::Local { .. } => TargetID::new(TargetKind::Local, self.name.as_str()),
        }
    }
}
