//! Compose service builds.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use devloop_core::{BuildArtifacts, BuildStrategy, TargetSpec};

use crate::capability::ComposeClient;
use crate::digest::sha256_hex;
use crate::error::io_err;
use crate::strategy::{BuildAndDeployer, BuildRequest, StrategyOutcome};

pub struct ComposeBuildAndDeployer {
    compose: Arc<dyn ComposeClient>,
}

impl ComposeBuildAndDeployer {
    pub fn new(compose: Arc<dyn ComposeClient>) -> Self {
        Self { compose }
    }
}

#[async_trait]
impl BuildAndDeployer for ComposeBuildAndDeployer {
    fn strategy(&self) -> BuildStrategy {
        BuildStrategy::ComposeBuild
    }

    async fn build_and_deploy(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> StrategyOutcome {
        let TargetSpec::Compose(spec) = &request.target.spec else {
            return StrategyOutcome::rejected("not a compose target");
        };
        let project = match tokio::fs::read(&spec.file).await {
            Ok(bytes) => bytes,
            Err(e) => return StrategyOutcome::Fatal(io_err(&spec.file, e)),
        };
        if let Err(err) = self.compose.up(spec, true, cancel).await {
            return StrategyOutcome::Fatal(err);
        }
        info!(service = %spec.service, "compose service is up");
        StrategyOutcome::success(BuildArtifacts {
            image_refs: Vec::new(),
            deploy_digest: Some(sha256_hex(&project)),
        })
    }
}
