//! Per-manifest runtime state: what's actually running right now

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::build_result::{ContainerRuntimeState, ObjectRef};

/// Attachment state of a single pod relative to the manifest's current
/// deploy, per the state machine in spec.md §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodAttachment {
    Unknown,
    Attached,
    Updated,
    Forgotten,
}

/// One observed pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub name: String,
    pub ancestor_uid: String,
    pub pod_template_spec_hash: String,
    pub resource_version: u64,
    pub creation_time: DateTime<Utc>,
    pub container_ids: Vec<String>,
    pub restart_count: i32,
    pub phase: String,
    pub attachment: PodAttachment,
}

/// Runtime state for a Kubernetes-deployed manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct K8sRuntimeState {
    pub pods: HashMap<String, Pod>,
    pub pod_ancestor_uid: Option<String>,
    pub deployed_entities: Vec<ObjectRef>,
    pub deployed_pod_template_spec_hash_set: HashSet<String>,
    pub has_ever_deployed_successfully: bool,
    pub baseline_restarts: HashMap<String, i32>,
    pub update_start_time: HashMap<String, DateTime<Utc>>,
    pub lbs: HashMap<String, Option<String>>,
}

impl K8sRuntimeState {
    /// Whether a pod with this ancestor UID and/or pod-template-spec hash
    /// belongs to the manifest's currently deployed entities
    /// (invariant 4 / spec.md §4.7).
    pub fn matches_current_deploy(&self, ancestor_uid: &str, pod_template_spec_hash: &str) -> bool {
        self.deployed_entities.iter().any(|e| e.uid == ancestor_uid)
            || self
                .deployed_pod_template_spec_hash_set
                .contains(pod_template_spec_hash)
    }

    /// Visible restart count clamps historical (pre-baseline) restarts to
    /// zero, per spec.md §4.7.
    pub fn visible_restarts(&self, pod_name: &str, current_restarts: i32) -> i32 {
        let baseline = self.baseline_restarts.get(pod_name).copied().unwrap_or(0);
        (current_restarts - baseline).max(0)
    }

    pub fn most_recent_pod(&self) -> Option<&Pod> {
        self.pods.values().max_by_key(|p| p.creation_time)
    }
}

/// Runtime state for a docker-compose-deployed manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerComposeState {
    pub container_id: Option<String>,
    pub container_state: Option<ContainerRuntimeState>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_ready_time: Option<DateTime<Utc>>,
}

/// Runtime state for a manifest deployed as a local process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalRuntimeState {
    pub pid: Option<u32>,
    pub status: LocalStatus,
    pub last_ready_or_succeeded_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalStatus {
    #[default]
    Unknown,
    Running,
    Succeeded,
    Failed,
    NotApplicable,
}

/// Sum type over the three deploy-target runtime shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RuntimeState {
    K8s(Box<K8sRuntimeState>),
    DockerCompose(DockerComposeState),
    Local(LocalRuntimeState),
}

impl RuntimeState {
    pub fn as_k8s(&self) -> Option<&K8sRuntimeState> {
        match self {
            RuntimeState::K8s(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_k8s_mut(&mut self) -> Option<&mut K8sRuntimeState> {
        match self {
            RuntimeState::K8s(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_docker_compose_mut(&mut self) -> Option<&mut DockerComposeState> {
        match self {
            RuntimeState::DockerCompose(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_local_mut(&mut self) -> Option<&mut LocalRuntimeState> {
        match self {
            RuntimeState::Local(s) => Some(s),
            _ => None,
        }
    }
}
