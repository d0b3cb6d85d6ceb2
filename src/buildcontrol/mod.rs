//! Picks what to build next and drives it through the build-and-deploy core.

pub mod controller;
pub mod image_queue;
pub mod pipeline;

pub use controller::{next_target_to_build, pending_files_for, tiltfile_name, HoldReason, NextBuild};
pub use image_queue::{ImageReuseProbe, ImageTargetQueue, NeverReuse};
pub use pipeline::{build_and_deploy, push_decision, BuildAndDeployer, ClusterClient, ImageBuilder, PipelineState, PushDecision};
