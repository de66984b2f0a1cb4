//! In-place container updates.
//!
//! Applies only when the previous deploy is still running, no dependency
//! was rebuilt and every changed file maps onto a sync rule. Anything else
//! falls through to a full image build.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use devloop_core::{BuildStrategy, LiveUpdateSpec, TargetKind};

use crate::capability::{ContainerUpdater, FileCopy};
use crate::error::BuildError;
use crate::strategy::{BuildAndDeployer, BuildRequest, StrategyOutcome};

pub struct LiveUpdateBuildAndDeployer {
    updater: Arc<dyn ContainerUpdater>,
}

impl LiveUpdateBuildAndDeployer {
    pub fn new(updater: Arc<dyn ContainerUpdater>) -> Self {
        Self { updater }
    }
}

#[async_trait]
impl BuildAndDeployer for LiveUpdateBuildAndDeployer {
    fn strategy(&self) -> BuildStrategy {
        BuildStrategy::LiveUpdate
    }

    async fn build_and_deploy(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> StrategyOutcome {
        let Some(spec) = &request.target.live_update else {
            return StrategyOutcome::rejected("target has no live_update rules");
        };
        if request.target.kind() == TargetKind::Local {
            return StrategyOutcome::rejected("local targets are not containers");
        }
        let Some(prior) = &request.prior else {
            return StrategyOutcome::rejected("nothing deployed yet");
        };
        if !prior.live {
            return StrategyOutcome::rejected("previous deploy is not running");
        }
        if !self.updater.supports_live_update() {
            return StrategyOutcome::rejected("container runtime cannot update in place");
        }
        if let Some(dep) = request.refreshed_deps.iter().next() {
            return StrategyOutcome::Rejected(format!("dependency '{dep}' was rebuilt"));
        }
        if request.changed_files.is_empty() {
            return StrategyOutcome::rejected("no changed files to sync");
        }
        let copies = match plan_copies(spec, &request.changed_files) {
            Ok(copies) => copies,
            Err(reason) => return StrategyOutcome::Rejected(reason),
        };

        match self.updater.update(request, &copies, &spec.run, cancel).await {
            Ok(()) => {
                info!(
                    target = %request.target.name,
                    files = copies.len(),
                    "synced files into running container"
                );
                StrategyOutcome::success(prior.artifacts.clone())
            }
            Err(BuildError::Cancelled) => StrategyOutcome::Fatal(BuildError::Cancelled),
            Err(err @ BuildError::RunStep { .. }) => StrategyOutcome::Fatal(err),
            Err(err) => StrategyOutcome::Rejected(format!("in-place update failed: {err}")),
        }
    }
}

/// Map every changed file onto its destination in the container.
///
/// Fails with the reason when a file forces a rebuild or is not covered by
/// any sync rule.
pub fn plan_copies(spec: &LiveUpdateSpec, changed: &[PathBuf]) -> Result<Vec<FileCopy>, String> {
    let mut copies = Vec::with_capacity(changed.len());
    for path in changed {
        if spec.forces_fallback(path) {
            return Err(format!("{} requires a full rebuild", path.display()));
        }
        let Some(rule) = spec.rule_for(path) else {
            return Err(format!("no sync match for {}", path.display()));
        };
        let relative = path.strip_prefix(&rule.local).unwrap_or(path.as_path());
        let remote = if relative.as_os_str().is_empty() {
            rule.remote.clone()
        } else {
            rule.remote.join(relative)
        };
        copies.push(FileCopy {
            local: path.clone(),
            remote,
        });
    }
    Ok(copies)
}
