//! Commands run on the developer's machine.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use devloop_core::{BuildArtifacts, BuildStrategy, TargetSpec};

use crate::capability::CommandRunner;
use crate::strategy::{BuildAndDeployer, BuildRequest, StrategyOutcome};

pub struct LocalTargetBuildAndDeployer {
    runner: Arc<dyn CommandRunner>,
}

impl LocalTargetBuildAndDeployer {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl BuildAndDeployer for LocalTargetBuildAndDeployer {
    fn strategy(&self) -> BuildStrategy {
        BuildStrategy::LocalCommand
    }

    async fn build_and_deploy(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> StrategyOutcome {
        let TargetSpec::Local(spec) = &request.target.spec else {
            return StrategyOutcome::rejected("not a local target");
        };
        match self.runner.run(spec, cancel).await {
            Ok(stdout) => {
                debug!(target = %request.target.name, %stdout, "local command finished");
                StrategyOutcome::success(BuildArtifacts::default())
            }
            Err(err) => StrategyOutcome::Fatal(err),
        }
    }
}
