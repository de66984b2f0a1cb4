//! # devloop-build
//!
//! Build strategies and the composite that chooses between them.
//!
//! [`CompositeBuilder::build`] turns one [`BuildRequest`] into one
//! [`devloop_core::BuildResult`]. Strategies reach Docker, Kubernetes and
//! the shell only through the traits in [`capability`].

pub mod capability;
pub mod clients;
pub mod compose;
pub mod composite;
pub mod digest;
pub mod error;
pub mod image;
pub mod live_update;
pub mod local;
pub mod strategy;

pub use capability::{
    Capabilities, ClusterClient, CommandRunner, ComposeClient, ContainerUpdater, FileCopy,
    ImageBuilder, ResourceProbe,
};
pub use clients::cli_capabilities;
pub use compose::ComposeBuildAndDeployer;
pub use composite::CompositeBuilder;
pub use error::BuildError;
pub use image::ImageBuildAndDeployer;
pub use live_update::LiveUpdateBuildAndDeployer;
pub use local::LocalTargetBuildAndDeployer;
pub use strategy::{BuildAndDeployer, BuildRequest, PriorDeploy, StrategyOutcome};
