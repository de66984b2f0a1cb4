//! devloop core library: domain types, manifest loading, the target graph and errors.
//!
//! Public API surface:
//! - [`types`]: newtypes, target definitions, build results
//! - [`settings`]: engine tuning knobs with defaults
//! - [`manifest`]: `devloop.yaml` load / save / validate / scaffold
//! - [`graph`]: dependency DAG and build order
//! - [`error`]: [`ConfigError`]

pub mod error;
pub mod graph;
pub mod manifest;
pub mod settings;
pub mod types;

pub use error::ConfigError;
pub use graph::TargetGraph;
pub use manifest::{Manifest, Validation};
pub use settings::{BackoffSettings, EngineSettings};
pub use types::{
    BuildArtifacts, BuildFailure, BuildResult, BuildStrategy, ComposeSpec, FailureKind,
    ImageSpec, K8sSpec, LiveUpdateSpec, LocalSpec, ResourceKind, ResourceObservation,
    ResourceStatus, SyncRule, TargetDefinition, TargetKind, TargetName, TargetSpec, TriggerMode,
    UpdateMode,
};
