//! Action: the only way to mutate EngineState (spec.md §4.2)

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::domain::build_result::{BuildReason, BuildResultSet};
use crate::domain::error::BuildError;
use crate::domain::manifest::{Manifest, TriggerMode};
use crate::domain::runtime::Pod;
use crate::domain::target::{ManifestName, TargetID};
use crate::logstore::LogLevel;
use crate::podtracker::PodEventKind;
use crate::store::state::{EngineMode, WatchSettings};

#[derive(Debug, Clone)]
pub struct InitAction {
    pub tiltfile_path: PathBuf,
    pub config_files: Vec<PathBuf>,
    pub user_args: Vec<String>,
    pub analytics_user_opt: Option<bool>,
    pub engine_mode: EngineMode,
}

#[derive(Debug, Clone)]
pub struct BuildStartedAction {
    pub name: ManifestName,
    pub files_changed: Vec<PathBuf>,
    pub reason: BuildReason,
    pub span_id: String,
    pub start_time: DateTime<Utc>,
    pub full_build_triggered: bool,
}

#[derive(Debug, Clone)]
pub struct BuildCompleteAction {
    pub name: ManifestName,
    pub span_id: String,
    pub finish_time: DateTime<Utc>,
    pub result: BuildResultSet,
    pub error: Option<BuildError>,
    pub build_types: Vec<String>,
    pub warning_count: u32,
}

#[derive(Debug, Clone)]
pub struct ConfigsReloadStartedAction {
    pub span_id: String,
    pub start_time: DateTime<Utc>,
    pub files_changed: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ConfigsReloadedAction {
    pub manifests: Vec<Manifest>,
    pub features: HashMap<String, bool>,
    pub secrets: Vec<String>,
    pub tiltignore: Vec<String>,
    pub watch_settings: WatchSettings,
    pub config_files: Vec<PathBuf>,
    pub finish_time: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct K8sDiscoveryAction {
    pub kind: PodEventKind,
    pub manifest_name: ManifestName,
    pub pod: Pod,
}

#[derive(Debug, Clone)]
pub struct ServiceChangeAction {
    pub manifest_name: ManifestName,
    pub service_name: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct K8sEventAction {
    pub involved_object_uid: String,
    pub message: String,
    pub level: LogLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileWatchKind {
    Create,
    Update,
    UpdateStatus,
    Delete,
}

#[derive(Debug, Clone)]
pub struct FileWatchAction {
    pub kind: FileWatchKind,
    pub manifest_name: ManifestName,
    pub target_id: TargetID,
    pub paths: Vec<PathBuf>,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LogActionPayload {
    pub manifest_name: Option<ManifestName>,
    pub span_id: String,
    pub level: LogLevel,
    pub fields: Vec<(String, String)>,
    pub text: String,
}

/// Tagged union of everything the reducer can apply. Closed by design (spec
/// §9): new effects are new variants, matched exhaustively in `reduce`.
#[derive(Debug, Clone)]
pub enum Action {
    Init(InitAction),
    Error { message: String },
    BuildStarted(BuildStartedAction),
    BuildComplete(BuildCompleteAction),
    ConfigsReloadStarted(ConfigsReloadStartedAction),
    ConfigsReloaded(ConfigsReloadedAction),
    K8sDiscovery(K8sDiscoveryAction),
    ServiceChange(ServiceChangeAction),
    K8sEvent(K8sEventAction),
    FileWatch(FileWatchAction),
    AppendToTriggerQueue { name: ManifestName, reason: BuildReason },
    OverrideTriggerMode { name: ManifestName, trigger_mode: TriggerMode },
    SetTiltfileArgs { args: Vec<String> },
    LogAction(LogActionPayload),
    Panic { message: String },
    HudExit { error: Option<String> },
}

impl Action {
    /// Exit-path actions run even when `FatalError` is already set (spec.md
    /// §4.2).
    pub fn runs_during_fatal_error(&self) -> bool {
        matches!(
            self,
            Action::Panic { .. } | Action::HudExit { .. } | Action::Error { .. }
        )
    }
}

/// The union of changes a batch of reduced actions produced, handed to every
/// subscriber (spec.md §4.3).
#[derive(Debug, Clone, Default)]
pub struct ChangeSummary {
    pub legacy: bool,
    pub manifest_names: HashSet<ManifestName>,
    pub config_changed: bool,
}

impl ChangeSummary {
    pub fn merge(&mut self, other: ChangeSummary) {
        self.legacy = self.legacy || other.legacy;
        self.manifest_names.extend(other.manifest_names);
        self.config_changed = self.config_changed || other.config_changed;
    }
}

pub trait Summarize {
    fn summarize(&self) -> ChangeSummary;
}

impl Summarize for Action {
    fn summarize(&self) -> ChangeSummary {
        let mut summary = ChangeSummary::default();
        match self {
            Action::BuildStarted(a) => {
                summary.manifest_names.insert(a.name.clone());
            }
            Action::BuildComplete(a) => {
                summary.manifest_names.insert(a.name.clone());
            }
            Action::K8sDiscovery(a) => {
                summary.manifest_names.insert(a.manifest_name.clone());
            }
            Action::ServiceChange(a) => {
                summary.manifest_names.insert(a.manifest_name.clone());
            }
            Action::FileWatch(a) => {
                summary.manifest_names.insert(a.manifest_name.clone());
            }
            Action::AppendToTriggerQueue { name, .. } => {
                summary.manifest_names.insert(name.clone());
            }
            Action::OverrideTriggerMode { name, .. } => {
                summary.manifest_names.insert(name.clone());
            }
            Action::ConfigsReloaded(_) | Action::ConfigsReloadStarted(_) => {
                summary.config_changed = true;
                summary.legacy = true;
            }
            _ => {
                summary.legacy = true;
            }
        }
        summary
    }
}
