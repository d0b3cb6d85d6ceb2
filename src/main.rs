//! devloop-core - reactive store and build scheduler core

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use devloop_core::buildcontrol::{
    build_and_deploy, next_target_to_build, tiltfile_name, ClusterClient, ImageBuilder, NeverReuse,
};
use devloop_core::config::{get_config_dir, get_data_dir, load_config};
use devloop_core::domain::build_result::{BuildResult, BuildState, ObjectRef};
use devloop_core::domain::manifest::{BuildDetails, DeployTarget, ImageRefs, Manifest, ManifestSource, TriggerMode};
use devloop_core::domain::target::TargetID;
use devloop_core::domain::error::BuildError;
use devloop_core::store::{Action, BuildCompleteAction, BuildStartedAction, ChangeSummary, ConfigsReloadedAction, EngineMode, EngineState, InitAction, Store, StoreHandle, Subscriber, TerminalMode, WatchSettings};

#[derive(Parser)]
#[command(name = "devloop")]
#[command(version = "0.1.0")]
#[command(about = "Reactive store and build scheduler for an incremental dev-cluster orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show resolved configuration
    Config,
    /// Run the engine against an in-memory fake cluster, exiting once idle
    Run {
        #[arg(long, default_value = "demo")]
        manifest: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "devloop_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config();

    match cli.command.unwrap_or(Commands::Run { manifest: "demo".into() }) {
        Commands::Config => {
            println!("Config directory: {}", get_config_dir().display());
            println!("Data directory:   {}", get_data_dir().display());
            println!("{:#?}", config);
            Ok(())
        }
        Commands::Run { manifest } => run(&manifest).await,
    }
}

/// Brings up a Store with one demo manifest, drives it to a steady state
/// against fake builder/cluster clients, and prints the outcome.
async fn run(manifest_name: &str) -> anyhow::Result<()> {
    let config = load_config();
    let state = EngineState::new(
        config.update_settings.max_parallel_updates,
        config.build_history_limit,
        config.log_scrub_min_secret_len,
        config.mode.into(),
        TerminalMode::Hud,
    );
    let store = Arc::new(Store::new(state, config.batch_window()));

    store
        .register_subscriber(Arc::new(BuildDriver {
            builder: FakeImageBuilder,
            cluster: FakeClusterClient,
        }))
        .await;

    store.dispatch(Action::Init(InitAction {
        tiltfile_path: "Tiltfile".into(),
        config_files: vec!["Tiltfile".into()],
        user_args: vec![],
        analytics_user_opt: None,
        engine_mode: EngineMode::Up,
    }));

    store.dispatch(Action::ConfigsReloaded(ConfigsReloadedAction {
        manifests: vec![demo_manifest(manifest_name)],
        features: HashMap::new(),
        secrets: vec![],
        tiltignore: vec![],
        watch_settings: WatchSettings::default(),
        config_files: vec!["Tiltfile".into()],
        finish_time: chrono::Utc::now(),
        error: None,
    }));

    tokio::time::sleep(Duration::from_millis(500)).await;

    let read = store.read().await;
    for name in &read.manifest_definition_order {
        let ms = read.manifest_state(name).unwrap();
        println!(
            "{name}: builds={} last_deploy={:?}",
            ms.build_history.len(),
            ms.last_successful_deploy_time
        );
    }
    Ok(())
}

fn demo_manifest(name: &str) -> Manifest {
    Manifest {
        name: devloop_core::domain::target::ManifestName::new(name),
        image_targets: vec![devloop_core::domain::manifest::ImageTarget {
            id: TargetID::image(format!("{name}-img")),
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
        }],
        deploy_target: DeployTarget::K8s {
            yaml: format!("kind: Deployment\nname: {name}"),
            image_maps: vec![TargetID::image(format!("{name}-img"))],
            is_stateful_set: false,
        },
        trigger_mode: TriggerMode::Auto,
        resource_dependencies: HashSet::new(),
        source: ManifestSource::Tiltfile,
    }
}

struct FakeImageBuilder;

#[async_trait]
impl ImageBuilder for FakeImageBuilder {
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

struct FakeClusterClient;

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn upsert(&self, _yaml: &str, _timeout: Duration) -> Result<Vec<ObjectRef>, BuildError> {
        Ok(vec![ObjectRef {
            uid: uuid::Uuid::new_v4().to_string(),
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

/// Subscriber that closes the loop between `BuildController` and the
/// build-and-deploy core: every notification it checks for a target to build
/// and, if one is ready, runs it to completion.
struct BuildDriver<B, C> {
    builder: B,
    cluster: C,
}

#[async_trait]
impl<B: ImageBuilder + Send + Sync + 'static, C: ClusterClient + Send + Sync + 'static> Subscriber
    for BuildDriver<B, C>
{
    async fn on_change(&self, store: &StoreHandle, _summary: &ChangeSummary) -> Result<(), BuildError> {
        let next = {
            let state = store.read().await;
            next_target_to_build(&state)
        };
        let Some(name) = next.name else { return Ok(()) };
        if name == tiltfile_name() {
            return Ok(());
        }

        let span_id = uuid::Uuid::new_v4().to_string();
        let start_time = chrono::Utc::now();
        let files_changed = {
            let state = store.read().await;
            devloop_core::buildcontrol::pending_files_for(&state, &name)
        };
        store.dispatch(Action::BuildStarted(BuildStartedAction {
            name: name.clone(),
            files_changed,
            reason: next.reason,
            span_id: span_id.clone(),
            start_time,
            full_build_triggered: false,
        }));

        let manifest = {
            let state = store.read().await;
            match state.manifest(&name) {
                Some(m) => m.clone(),
                None => return Ok(()),
            }
        };

        let outcome = build_and_deploy(
            &manifest,
            &HashMap::<TargetID, BuildState>::new(),
            &self.builder,
            &self.cluster,
            &NeverReuse,
            false,
            &span_id,
        )
        .await;

        let (result, error) = match outcome {
            Ok(result) => (result, None),
            Err((partial, e)) => (partial, Some(e)),
        };

        store.dispatch(Action::BuildComplete(BuildCompleteAction {
            name,
            span_id,
            finish_time: chrono::Utc::now(),
            result,
            error,
            build_types: vec!["docker".into()],
            warning_count: 0,
        }));
        Ok(())
    }
}
