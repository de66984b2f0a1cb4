//! Starts builds.
//!
//! The controller is a subscriber: on every snapshot it asks
//! [`crate::buildcontrol`] for the next target, records the start through
//! the store, and runs the composite builder on a separate task so the
//! subscriber stays responsive. At most one build runs at a time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use devloop_build::{BuildRequest, Capabilities, CompositeBuilder, PriorDeploy};
use devloop_core::{BuildResult, TargetDefinition, TargetName, UpdateMode};

use crate::action::Action;
use crate::buildcontrol::{next_retry_at, next_target_to_build, Selection};
use crate::state::EngineState;
use crate::store::StoreHandle;
use crate::subscriber::Subscriber;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

enum Builders {
    /// One composite per update mode, rebuilt when the mode changes.
    PerMode {
        caps: Capabilities,
        cached: Mutex<Option<(UpdateMode, Arc<CompositeBuilder>)>>,
    },
    Fixed(Arc<CompositeBuilder>),
}

/// The build the controller started last, until the store shows its end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launched {
    pub target: TargetName,
    /// `counters.builds_completed` in the snapshot the build was selected from.
    pub completions_before: u64,
}

impl Launched {
    pub fn new(state: &EngineState, target: TargetName) -> Self {
        Self {
            target,
            completions_before: state.counters.builds_completed,
        }
    }

    /// Whether `state` is past this build, so another one may start.
    ///
    /// Snapshots can lag the controller's own dispatches: a finished build
    /// whose `BuildStarted` is still queued looks stale and idle. The slot
    /// stays taken until the completion has been applied, or until the
    /// target is gone and the completion can no longer apply.
    pub fn settled_in(&self, state: &EngineState, task_done: bool) -> bool {
        if state.counters.builds_completed > self.completions_before {
            return true;
        }
        task_done && state.current_build.is_none() && state.target(&self.target).is_none()
    }
}

struct InFlight {
    launched: Launched,
    definition: TargetDefinition,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct BuildController {
    builders: Builders,
    in_flight: Arc<Mutex<Option<InFlight>>>,
    shutdown: CancellationToken,
}

impl BuildController {
    pub fn new(caps: Capabilities) -> Self {
        Self::with_builders(Builders::PerMode {
            caps,
            cached: Mutex::new(None),
        })
    }

    /// Always build with `builder`, whatever the configured update mode.
    pub fn with_builder(builder: CompositeBuilder) -> Self {
        Self::with_builders(Builders::Fixed(Arc::new(builder)))
    }

    fn with_builders(builders: Builders) -> Self {
        Self {
            builders,
            in_flight: Arc::new(Mutex::new(None)),
            shutdown: CancellationToken::new(),
        }
    }

    fn builder_for(&self, mode: UpdateMode) -> Arc<CompositeBuilder> {
        match &self.builders {
            Builders::Fixed(builder) => builder.clone(),
            Builders::PerMode { caps, cached } => {
                let mut cached = lock(cached);
                match cached.as_ref() {
                    Some((cached_mode, builder)) if *cached_mode == mode => builder.clone(),
                    _ => {
                        let builder = Arc::new(CompositeBuilder::default_order(caps, mode));
                        debug!(%mode, strategies = ?builder.strategies(), "build strategies configured");
                        *cached = Some((mode, builder.clone()));
                        builder
                    }
                }
            }
        }
    }

    /// Cancel the running build if a reload changed or removed its target.
    fn check_in_flight(flight: &InFlight, state: &EngineState) {
        if flight.cancel.is_cancelled() || flight.handle.is_finished() {
            return;
        }
        let requested = state
            .current_build
            .as_ref()
            .is_some_and(|build| build.target == flight.launched.target && build.cancel_requested);
        let redefined = state
            .target(&flight.launched.target)
            .map_or(true, |target| target.definition != flight.definition);
        if requested || redefined {
            info!(target = %flight.launched.target, "target reconfigured; cancelling build");
            flight.cancel.cancel();
        }
    }

    fn start(&self, store: &StoreHandle, state: &EngineState, selection: Selection) {
        let Some(request) = build_request(state, &selection.target) else {
            return;
        };
        let at = start_time(state, Utc::now());
        info!(target = %selection.target, reason = %selection.reason, "starting build");

        let mut slot = lock(&self.in_flight);
        if !store.dispatch(Action::build_started(selection.target.clone(), selection.reason, at)) {
            return;
        }

        let builder = self.builder_for(state.settings.update_mode);
        let cancel = self.shutdown.child_token();
        let task_cancel = cancel.clone();
        let task_store = store.clone();
        let definition = request.target.clone();
        let handle = tokio::spawn(async move {
            let result = builder.build(&request, &task_cancel).await;
            task_store.dispatch(Action::build_completed(not_before(result, at)));
        });

        *slot = Some(InFlight {
            launched: Launched::new(state, selection.target),
            definition,
            cancel,
            handle,
        });
    }
}

#[async_trait]
impl Subscriber for BuildController {
    fn name(&self) -> &'static str {
        "build-controller"
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(POLL_INTERVAL)
    }

    async fn on_change(&self, store: &StoreHandle, state: Arc<EngineState>) -> Vec<Action> {
        {
            let mut slot = lock(&self.in_flight);
            if let Some(flight) = slot.as_ref() {
                if !flight.launched.settled_in(&state, flight.handle.is_finished()) {
                    Self::check_in_flight(flight, &state);
                    return Vec::new();
                }
                debug!(target = %flight.launched.target, "build completion applied");
                *slot = None;
            }
        }
        if state.current_build.is_some() || self.shutdown.is_cancelled() {
            return Vec::new();
        }

        match next_target_to_build(&state, Utc::now()) {
            Some(selection) => self.start(store, &state, selection),
            None => {
                if let Some(at) = next_retry_at(&state) {
                    debug!(retry_at = %at, "waiting for retry backoff");
                }
            }
        }
        Vec::new()
    }

    async fn on_shutdown(&self) {
        self.shutdown.cancel();
        let flight = lock(&self.in_flight).take();
        if let Some(flight) = flight {
            info!(target = %flight.launched.target, "waiting for cancelled build");
            flight.cancel.cancel();
            if let Err(err) = flight.handle.await {
                warn!(target = %flight.launched.target, error = %err, "build task failed");
            }
        }
    }
}

/// The request for `target`, from the inputs it has pending in `state`.
pub fn build_request(state: &EngineState, target: &TargetName) -> Option<BuildRequest> {
    let target_state = state.target(target)?;
    let status = &target_state.status;
    let mut request = BuildRequest::new(target_state.definition.clone());
    request.changed_files = status.pending_files.keys().cloned().collect();
    request.refreshed_deps = status.pending_deps.clone();
    request.prior = status.last_success.as_ref().map(|artifacts| PriorDeploy {
        artifacts: artifacts.clone(),
        live: status.is_live(),
    });
    for dep in &target_state.definition.deps {
        if let Some(artifacts) = state.target(dep).and_then(|d| d.status.last_success.as_ref()) {
            request.dependencies.insert(dep.clone(), artifacts.clone());
        }
    }
    Some(request)
}

/// A start strictly after every recorded completion, so history stays
/// ordered even if the wall clock steps back.
fn start_time(state: &EngineState, now: DateTime<Utc>) -> DateTime<Utc> {
    match state.latest_completion() {
        Some(latest) if latest >= now => latest + TimeDelta::microseconds(1),
        _ => now,
    }
}

fn not_before(mut result: BuildResult, at: DateTime<Utc>) -> BuildResult {
    if result.started_at < at {
        let duration = TimeDelta::milliseconds(i64::try_from(result.duration_ms).unwrap_or(i64::MAX));
        result.started_at = at;
        result.finished_at = at + duration;
    }
    result
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
