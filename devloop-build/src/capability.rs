//! Ports to the outside world.
//!
//! Strategies never spawn processes themselves; they go through these
//! traits so tests can substitute in-memory fakes. [`crate::clients`]
//! provides the implementations that shell out to `docker`, `kubectl` and
//! `sh`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use devloop_core::{
    BuildArtifacts, ComposeSpec, ImageSpec, LocalSpec, ResourceObservation, TargetDefinition,
};

use crate::error::BuildError;
use crate::strategy::BuildRequest;

/// One file to copy into a running container. A `local` path that no
/// longer exists means the remote copy is deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCopy {
    pub local: PathBuf,
    pub remote: PathBuf,
}

#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build `spec` tagged as `tag`; returns the full image reference.
    async fn build(
        &self,
        spec: &ImageSpec,
        tag: &str,
        cancel: &CancellationToken,
    ) -> Result<String, BuildError>;

    async fn push(&self, image_ref: &str, cancel: &CancellationToken) -> Result<(), BuildError>;
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Apply a multi-document YAML stream; returns the applied object names.
    async fn apply(&self, yaml: &str, cancel: &CancellationToken)
        -> Result<Vec<String>, BuildError>;
}

#[async_trait]
pub trait ComposeClient: Send + Sync {
    /// Build (when `build` is set) and (re)start a single service.
    async fn up(
        &self,
        spec: &ComposeSpec,
        build: bool,
        cancel: &CancellationToken,
    ) -> Result<(), BuildError>;
}

#[async_trait]
pub trait ContainerUpdater: Send + Sync {
    /// Whether the runtime can update containers in place at all.
    fn supports_live_update(&self) -> bool;

    /// Copy `copies` into the containers of `request.target`, then run
    /// `run` inside them. A failing `run` command is reported as
    /// [`BuildError::RunStep`]; anything else is a transport failure.
    async fn update(
        &self,
        request: &BuildRequest,
        copies: &[FileCopy],
        run: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), BuildError>;
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a local command to completion; returns its trimmed stdout.
    async fn run(&self, spec: &LocalSpec, cancel: &CancellationToken)
        -> Result<String, BuildError>;
}

/// Reports what is currently running for a deployed target.
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn observe(
        &self,
        target: &TargetDefinition,
        deployed: &BuildArtifacts,
    ) -> Result<Vec<ResourceObservation>, BuildError>;
}

/// Everything the strategies and the resource monitor need, shared.
#[derive(Clone)]
pub struct Capabilities {
    pub images: Arc<dyn ImageBuilder>,
    pub cluster: Arc<dyn ClusterClient>,
    pub compose: Arc<dyn ComposeClient>,
    pub updater: Arc<dyn ContainerUpdater>,
    pub commands: Arc<dyn CommandRunner>,
    pub probe: Arc<dyn ResourceProbe>,
}
