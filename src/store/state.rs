//! EngineState: the Store's entire contents (spec.md §3)

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::manifest::Manifest;
use crate::domain::manifest_state::ManifestState;
use crate::domain::target::ManifestName;
use crate::logstore::LogStore;

/// Whether the engine is driving an interactive session or a one-shot CI run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    Up,
    Ci,
}

/// How the process is presenting itself to the user; governs whether a fatal
/// error terminates the Store loop (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalMode {
    Hud,
    Stream,
    Cli,
}

#[derive(Debug, Clone)]
pub struct UpdateSettings {
    pub max_parallel_updates: usize,
    pub k8s_upsert_timeout: Duration,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            max_parallel_updates: 1,
            k8s_upsert_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WatchSettings {
    pub ignores: Vec<String>,
}

/// Top-level Store contents. `manifests`/`manifest_states`/
/// `manifest_definition_order` together implement `ManifestTarget` (design
/// note §9): a manifest and its state are held in separate maps, keyed by
/// the same `ManifestName`, with no back-pointer from state to manifest.
pub struct EngineState {
    pub manifests: HashMap<ManifestName, Arc<Manifest>>,
    pub manifest_states: HashMap<ManifestName, ManifestState>,
    pub manifest_definition_order: Vec<ManifestName>,
    pub tiltfile_state: ManifestState,
    pub tiltfile_path: Option<PathBuf>,
    pub tiltfile_args: Vec<String>,
    pub analytics_user_opt: Option<bool>,
    pub currently_building: HashSet<ManifestName>,
    pub started_build_count: u64,
    pub completed_build_count: u64,
    pub started_tiltfile_load_count: u64,
    pub trigger_queue: Vec<ManifestName>,
    pub update_settings: UpdateSettings,
    pub log_store: LogStore,
    pub config_files: Vec<PathBuf>,
    pub tiltignore: Vec<String>,
    pub watch_settings: WatchSettings,
    pub secrets: Vec<String>,
    pub features: HashMap<String, bool>,
    pub fatal_error: Option<String>,
    pub exit_signal: bool,
    pub exit_error: Option<String>,
    pub user_exited: bool,
    pub panic_exited: Option<String>,
    pub engine_mode: EngineMode,
    pub terminal_mode: TerminalMode,
    pub build_history_limit: usize,
    pub config_reload_checkpoint: usize,
}

impl EngineState {
    pub fn new(
        max_parallel_updates: usize,
        build_history_limit: usize,
        log_scrub_min_secret_len: usize,
        engine_mode: EngineMode,
        terminal_mode: TerminalMode,
    ) -> Self {
        Self {
            manifests: HashMap::new(),
            manifest_states: HashMap::new(),
            manifest_definition_order: Vec::new(),
            tiltfile_state: ManifestState::new(build_history_limit),
            tiltfile_path: None,
            tiltfile_args: Vec::new(),
            analytics_user_opt: None,
            currently_building: HashSet::new(),
            started_build_count: 0,
            completed_build_count: 0,
            started_tiltfile_load_count: 0,
            trigger_queue: Vec::new(),
            update_settings: UpdateSettings {
                max_parallel_updates,
                ..Default::default()
            },
            log_store: LogStore::new(log_scrub_min_secret_len),
            config_files: Vec::new(),
            tiltignore: Vec::new(),
            watch_settings: WatchSettings::default(),
            secrets: Vec::new(),
            features: HashMap::new(),
            fatal_error: None,
            exit_signal: false,
            exit_error: None,
            user_exited: false,
            panic_exited: None,
            engine_mode,
            terminal_mode,
            build_history_limit,
            config_reload_checkpoint: 0,
        }
    }

    pub fn manifest(&self, name: &ManifestName) -> Option<&Arc<Manifest>> {
        self.manifests.get(name)
    }

    pub fn manifest_state(&self, name: &ManifestName) -> Option<&ManifestState> {
        self.manifest_states.get(name)
    }

    pub fn manifest_state_mut(&mut self, name: &ManifestName) -> Option<&mut ManifestState> {
        self.manifest_states.get_mut(name)
    }

    pub fn ordered_manifests(&self) -> impl Iterator<Item = &Arc<Manifest>> {
        self.manifest_definition_order
            .iter()
            .filter_map(move |n| self.manifests.get(n))
    }

    /// Store-loop termination contract, spec.md §4.3.
    pub fn should_terminate(&self) -> bool {
        self.exit_signal
            || self.user_exited
            || self.panic_exited.is_some()
            || (self.fatal_error.is_some() && self.terminal_mode != TerminalMode::Hud)
    }

    pub fn available_build_slots(&self) -> usize {
        self.update_settings
            .max_parallel_updates
            .saturating_sub(self.currently_building.len())
    }

    /// Invariants 1-4 and 6, checked in tests and debug assertions — never on
    /// the hot path.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        for name in &self.manifest_definition_order {
            assert!(self.manifests.contains_key(name), "invariant 1 violated for {name}");
        }
        assert_eq!(
            self.manifest_definition_order.len(),
            self.manifests.len(),
            "invariant 1 violated: order/map size mismatch"
        );
        assert!(
            self.currently_building.len() <= self.update_settings.max_parallel_updates,
            "invariant 2 violated"
        );
        for name in &self.currently_building {
            assert!(self.manifests.contains_key(name), "invariant 2 violated: unknown manifest building");
        }
        for name in &self.currently_building {
            let state = self.manifest_state(name).expect("building manifest must have state");
            assert!(state.is_building(), "invariant 3 violated for {name}");
        }
        for (name, state) in &self.manifest_states {
            if !self.currently_building.contains(name) {
                assert!(!state.is_building(), "invariant 3 violated for {name}");
            }
        }
        let mut seen = HashSet::new();
        for name in &self.trigger_queue {
            assert!(seen.insert(name), "invariant 4 violated: duplicate {name} in trigger queue");
        }
        for state in self.manifest_states.values() {
            assert!(
                state.build_history.len() <= state.build_history_limit,
                "invariant 6 violated"
            );
        }
    }
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}
