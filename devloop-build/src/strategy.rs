//! The build-and-deploy contract shared by every strategy.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use devloop_core::{BuildArtifacts, BuildStrategy, TargetDefinition, TargetName};

use crate::error::BuildError;

/// What the previous successful build of a target left running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorDeploy {
    pub artifacts: BuildArtifacts,
    /// At least one observed runtime object is still running.
    pub live: bool,
}

/// Everything a strategy needs to build one target once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub target: TargetDefinition,
    /// Files changed since the last build, sorted.
    pub changed_files: Vec<PathBuf>,
    pub prior: Option<PriorDeploy>,
    /// Last successful artifacts of each direct dependency.
    pub dependencies: BTreeMap<TargetName, BuildArtifacts>,
    /// Dependencies rebuilt since this target's last build.
    pub refreshed_deps: BTreeSet<TargetName>,
}

impl BuildRequest {
    pub fn new(target: TargetDefinition) -> Self {
        Self {
            target,
            changed_files: Vec::new(),
            prior: None,
            dependencies: BTreeMap::new(),
            refreshed_deps: BTreeSet::new(),
        }
    }

    /// Image references produced by the dependencies, in name order.
    pub fn dependency_images(&self) -> Vec<String> {
        self.dependencies
            .values()
            .flat_map(|artifacts| artifacts.image_refs.iter().cloned())
            .collect()
    }
}

/// How a single strategy responded to a request.
#[derive(Debug)]
pub enum StrategyOutcome {
    Success {
        artifacts: BuildArtifacts,
        warnings: Vec<String>,
    },
    /// Not applicable; the next strategy should try.
    Rejected(String),
    /// Applicable but failed; no further strategy runs.
    Fatal(BuildError),
}

impl StrategyOutcome {
    pub fn success(artifacts: BuildArtifacts) -> Self {
        StrategyOutcome::Success {
            artifacts,
            warnings: Vec::new(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        StrategyOutcome::Rejected(reason.into())
    }
}

/// One way of turning a target's inputs into a running deployment.
#[async_trait]
pub trait BuildAndDeployer: Send + Sync {
    fn strategy(&self) -> BuildStrategy;

    /// Check applicability first and return [`StrategyOutcome::Rejected`]
    /// without side effects when the strategy does not apply.
    async fn build_and_deploy(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> StrategyOutcome;
}
