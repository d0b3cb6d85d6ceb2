//! Build results, build records, and the reason a build was scheduled

use std::collections::HashMap;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::target::TargetID;

bitflags! {
    /// Why a manifest was picked to build. Folded together by
    /// `NextBuildReason` per spec.md §4.4; multiple bits can be set at once
    /// (e.g. an explicit trigger arriving while files are also pending).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct BuildReason: u32 {
        const NONE                 = 0;
        const TRIGGER_QUEUE         = 1 << 0;
        const CHANGED_FILES         = 1 << 1;
        const CHANGED_DEPS          = 1 << 2;
        const INITIAL_BUILD         = 1 << 3;
        const CRASH                 = 1 << 4;
        const CONFIG_CHANGE         = 1 << 5;
        const PENDING_MANIFEST_CHANGE = 1 << 6;
    }
}

impl Default for BuildReason {
    fn default() -> Self {
        BuildReason::NONE
    }
}

/// An object reference to something the cluster client deployed, as returned
/// by `ClusterClient::upsert`. Every deployed entity must have a non-empty
/// UID (spec.md §6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub kind: String,
}

/// One container's runtime state as reported by the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerRuntimeState {
    Waiting { reason: String },
    Running,
    Terminated { exit_code: i32, reason: String },
}

/// Sum type of everything a build stage can produce, keyed into a
/// `BuildResultSet` by the `TargetID` it was built for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BuildResult {
    Image {
        id: TargetID,
        local_ref: String,
        cluster_ref: String,
    },
    LiveUpdate {
        id: TargetID,
        container_ids: Vec<String>,
    },
    K8sDeploy {
        id: TargetID,
        deployed_entities: Vec<ObjectRef>,
        pod_template_spec_hashes: Vec<String>,
    },
    DockerComposeDeploy {
        id: TargetID,
        container_id: String,
        container_state: ContainerRuntimeState,
    },
    Local {
        id: TargetID,
    },
}

impl BuildResult {
    pub fn target_id(&self) -> &TargetID {
        match self {
            BuildResult::Image { id, .. } => id,
            BuildResult::LiveUpdate { id, .. } => id,
            BuildResult::K8sDeploy { id, .. } => id,
            BuildResult::DockerComposeDeploy { id, .. } => id,
            BuildResult::Local { id } => id,
        }
    }

    pub fn live_updated_container_ids(&self) -> Vec<String> {
        match self {
            BuildResult::LiveUpdate { container_ids, .. } => container_ids.clone(),
            _ => Vec::new(),
        }
    }

    pub fn is_live_update(&self) -> bool {
        matches!(self, BuildResult::LiveUpdate { .. })
    }
}

/// The set of results a single `build_and_deploy` invocation produced,
/// keyed by the target each result is for (spec.md §4.6 / §10.6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildResultSet(pub HashMap<TargetID, BuildResult>);

impl BuildResultSet {
    pub fn insert(&mut self, result: BuildResult) {
        self.0.insert(result.target_id().clone(), result);
    }

    pub fn image_result(&self, id: &TargetID) -> Option<&BuildResult> {
        self.0.get(id).filter(|r| matches!(r, BuildResult::Image { .. }))
    }

    pub fn deploy_result(&self) -> Option<&BuildResult> {
        self.0.values().find(|r| {
            matches!(
                r,
                BuildResult::K8sDeploy { .. }
                    | BuildResult::DockerComposeDeploy { .. }
                    | BuildResult::Local { .. }
            )
        })
    }

    pub fn live_updated_container_ids(&self) -> Vec<String> {
        self.0
            .values()
            .flat_map(|r| r.live_updated_container_ids())
            .collect()
    }

    pub fn has_live_update(&self) -> bool {
        self.0.values().any(|r| r.is_live_update())
    }

    pub fn values(&self) -> impl Iterator<Item = &BuildResult> {
        self.0.values()
    }
}

/// Input to the builder for one target, assembled by the controller from the
/// manifest's current `BuildStatus` before invoking the build-and-deploy core.
#[derive(Debug, Clone, Default)]
pub struct BuildState {
    pub last_successful_result: Option<BuildResult>,
    pub files_changed_set: Vec<std::path::PathBuf>,
    pub deps_changed_set: Vec<TargetID>,
    pub image_build_triggered: bool,
    pub running_containers: Vec<String>,
}

/// One entry in a manifest's bounded build history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    pub span_id: String,
    pub start_time: DateTime<Utc>,
    pub finish_time: Option<DateTime<Utc>>,
    pub edits: Vec<String>,
    pub reason: BuildReason,
    pub build_types: Vec<String>,
    pub warning_count: u32,
    pub error: Option<String>,
    pub full_build_triggered: bool,
}

impl BuildRecord {
    pub fn new(span_id: String, start_time: DateTime<Utc>, edits: Vec<String>, reason: BuildReason) -> Self {
        Self {
            span_id,
            start_time,
            finish_time: None,
            edits,
            reason,
            build_types: Vec::new(),
            warning_count: 0,
            error: None,
            full_build_triggered: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.finish_time.is_none() && self.start_time == DateTime::<Utc>::UNIX_EPOCH
    }
}

impl Default for BuildRecord {
    fn default() -> Self {
        Self {
            span_id: String::new(),
            start_time: DateTime::<Utc>::UNIX_EPOCH,
            finish_time: None,
            edits: Vec::new(),
            reason: BuildReason::NONE,
            build_types: Vec::new(),
            warning_count: 0,
            error: None,
            full_build_triggered: false,
        }
    }
}
