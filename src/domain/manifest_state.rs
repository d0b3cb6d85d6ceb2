//! Per-manifest mutable state, owned exclusively by the Store

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::build_result::{BuildReason, BuildRecord, BuildResult};
use super::runtime::RuntimeState;
use super::target::TargetID;

/// Pending-change bookkeeping and last result for one buildable target within
/// a manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildStatus {
    pub pending_file_changes: HashMap<PathBuf, DateTime<Utc>>,
    pub pending_dependency_changes: HashMap<TargetID, DateTime<Utc>>,
    pub last_result: Option<BuildResult>,
}

impl BuildStatus {
    /// Invariant 5 / testable property 5: drop every pending change whose
    /// timestamp is at-or-before the build that consumed it.
    pub fn clear_pending_changes_before(&mut self, start_time: DateTime<Utc>) {
        self.pending_file_changes.retain(|_, t| *t > start_time);
        self.pending_dependency_changes.retain(|_, t| *t > start_time);
    }

    pub fn oldest_pending_timestamp(&self) -> Option<DateTime<Utc>> {
        self.pending_file_changes
            .values()
            .chain(self.pending_dependency_changes.values())
            .min()
            .copied()
    }
}

/// Mutable record tracked per manifest, per spec.md §3.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestState {
    pub build_statuses: HashMap<TargetID, BuildStatus>,
    #[serde(skip)]
    pub runtime_state: Option<RuntimeState>,
    pub pending_manifest_change: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub current_build: Option<BuildRecord>,
    pub build_history: Vec<BuildRecord>,
    pub build_history_limit: usize,
    pub live_updated_container_ids: std::collections::HashSet<String>,
    pub needs_rebuild_from_crash: bool,
    pub trigger_reason: BuildReason,
    pub last_successful_deploy_time: Option<DateTime<Utc>>,
}

impl ManifestState {
    pub fn new(build_history_limit: usize) -> Self {
        Self {
            build_history_limit,
            ..Default::default()
        }
    }

    pub fn is_building(&self) -> bool {
        self.current_build.is_some()
    }

    /// Invariant 6: push to the front, truncate at `build_history_limit`.
    pub fn push_history(&mut self, record: BuildRecord) {
        self.build_history.insert(0, record);
        self.build_history.truncate(self.build_history_limit);
    }

    pub fn status_for(&mut self, id: &TargetID) -> &mut BuildStatus {
        self.build_statuses.entry(id.clone()).or_default()
    }

    pub fn clear_pending_changes_before(&mut self, start_time: DateTime<Utc>) {
        for status in self.build_statuses.values_mut() {
            status.clear_pending_changes_before(start_time);
        }
    }
}
