//! Ordered fallback across build strategies.
//!
//! Strategies are tried in order. A rejection passes the request on to the
//! next strategy; a success or a failure ends the attempt. When every
//! strategy rejects, the build fails fatally with the collected reasons.

use std::time::Instant;

use chrono::{TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use devloop_core::{
    BuildArtifacts, BuildFailure, BuildResult, BuildStrategy, FailureKind, UpdateMode,
};

use crate::capability::Capabilities;
use crate::compose::ComposeBuildAndDeployer;
use crate::image::ImageBuildAndDeployer;
use crate::live_update::LiveUpdateBuildAndDeployer;
use crate::local::LocalTargetBuildAndDeployer;
use crate::strategy::{BuildAndDeployer, BuildRequest, StrategyOutcome};

pub struct CompositeBuilder {
    strategies: Vec<Box<dyn BuildAndDeployer>>,
}

impl CompositeBuilder {
    pub fn new(strategies: Vec<Box<dyn BuildAndDeployer>>) -> Self {
        Self { strategies }
    }

    /// The standard order: in-place update, image, compose, local.
    /// `UpdateMode::Image` leaves out the in-place update.
    pub fn default_order(caps: &Capabilities, mode: UpdateMode) -> Self {
        let mut strategies: Vec<Box<dyn BuildAndDeployer>> = Vec::with_capacity(4);
        if mode == UpdateMode::Auto {
            strategies.push(Box::new(LiveUpdateBuildAndDeployer::new(caps.updater.clone())));
        }
        strategies.push(Box::new(ImageBuildAndDeployer::new(
            caps.images.clone(),
            caps.cluster.clone(),
        )));
        strategies.push(Box::new(ComposeBuildAndDeployer::new(caps.compose.clone())));
        strategies.push(Box::new(LocalTargetBuildAndDeployer::new(
            caps.commands.clone(),
        )));
        Self::new(strategies)
    }

    pub fn strategies(&self) -> Vec<BuildStrategy> {
        self.strategies.iter().map(|s| s.strategy()).collect()
    }

    /// Build `request.target` once. Always returns a result, including
    /// when the attempt is cancelled.
    pub async fn build(&self, request: &BuildRequest, cancel: &CancellationToken) -> BuildResult {
        let attempt = Attempt::start(request);
        let mut rejections = Vec::new();

        for strategy in &self.strategies {
            if cancel.is_cancelled() {
                return attempt.fail(None, FailureKind::Cancelled, "build cancelled".into());
            }
            let name = strategy.strategy();
            match strategy.build_and_deploy(request, cancel).await {
                StrategyOutcome::Success {
                    artifacts,
                    warnings,
                } => {
                    let result = attempt.succeed(name, artifacts, warnings);
                    info!(
                        target = %result.target,
                        strategy = %name,
                        duration_ms = result.duration_ms,
                        "build succeeded"
                    );
                    return result;
                }
                StrategyOutcome::Rejected(reason) => {
                    debug!(target = %request.target.name, strategy = %name, %reason, "strategy not applicable");
                    rejections.push(format!("{name}: {reason}"));
                }
                StrategyOutcome::Fatal(err) => {
                    let kind = err.failure_kind();
                    warn!(target = %request.target.name, strategy = %name, %kind, error = %err, "build failed");
                    return attempt.fail(Some(name), kind, err.to_string());
                }
            }
        }

        let message = format!(
            "no strategy could build target '{}' ({})",
            request.target.name,
            rejections.join("; ")
        );
        warn!(target = %request.target.name, "{message}");
        attempt.fail(None, FailureKind::Fatal, message)
    }
}

struct Attempt<'a> {
    request: &'a BuildRequest,
    started_at: chrono::DateTime<Utc>,
    clock: Instant,
}

impl<'a> Attempt<'a> {
    fn start(request: &'a BuildRequest) -> Self {
        Self {
            request,
            started_at: Utc::now(),
            clock: Instant::now(),
        }
    }

    fn succeed(
        self,
        strategy: BuildStrategy,
        artifacts: BuildArtifacts,
        warnings: Vec<String>,
    ) -> BuildResult {
        self.finish(Some(strategy), artifacts, warnings, None)
    }

    fn fail(self, strategy: Option<BuildStrategy>, kind: FailureKind, message: String) -> BuildResult {
        self.finish(
            strategy,
            BuildArtifacts::default(),
            Vec::new(),
            Some(BuildFailure { kind, message }),
        )
    }

    fn finish(
        self,
        strategy: Option<BuildStrategy>,
        artifacts: BuildArtifacts,
        warnings: Vec<String>,
        failure: Option<BuildFailure>,
    ) -> BuildResult {
        let elapsed = self.clock.elapsed();
        BuildResult {
            target: self.request.target.name.clone(),
            strategy,
            artifacts,
            started_at: self.started_at,
            finished_at: self.started_at + TimeDelta::from_std(elapsed).unwrap_or(TimeDelta::zero()),
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            warnings,
            failure,
        }
    }
}
