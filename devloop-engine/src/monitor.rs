//! Passive subscribers: runtime resource polling and status logging.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use devloop_build::ResourceProbe;
use devloop_core::{ResourceKind, ResourceObservation, ResourceStatus, TargetKind, TargetName};

use crate::action::{Action, ErrorSource};
use crate::state::{EngineState, TargetPhase};
use crate::store::StoreHandle;
use crate::subscriber::Subscriber;

// ---------------------------------------------------------------------------
// ResourceMonitor
// ---------------------------------------------------------------------------

/// Polls the runtime for what each deployed target left running and
/// reports changes as `ClusterResourceObserved`.
pub struct ResourceMonitor {
    probe: Arc<dyn ResourceProbe>,
    interval: Duration,
    last_probe: Mutex<Option<Instant>>,
    /// Last probe error per target, so a persistent failure is reported once.
    last_errors: Mutex<BTreeMap<TargetName, String>>,
}

impl ResourceMonitor {
    pub fn new(probe: Arc<dyn ResourceProbe>, interval: Duration) -> Self {
        Self {
            probe,
            interval,
            last_probe: Mutex::new(None),
            last_errors: Mutex::new(BTreeMap::new()),
        }
    }

    fn due(&self) -> bool {
        let mut last = lock(&self.last_probe);
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    fn report_error(&self, target: &TargetName, message: String) -> Option<Action> {
        let mut errors = lock(&self.last_errors);
        if errors.get(target) == Some(&message) {
            return None;
        }
        warn!(target = %target, error = %message, "resource probe failed");
        errors.insert(target.clone(), message.clone());
        Some(Action::error(ErrorSource::Monitor, Some(target.clone()), message))
    }
}

#[async_trait]
impl Subscriber for ResourceMonitor {
    fn name(&self) -> &'static str {
        "resource-monitor"
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.interval)
    }

    async fn on_change(&self, _store: &StoreHandle, state: Arc<EngineState>) -> Vec<Action> {
        if !self.due() {
            return Vec::new();
        }

        let deployed: Vec<_> = state
            .targets
            .values()
            .filter(|target| target.definition.kind() != TargetKind::Local)
            .filter(|target| !state.is_building(&target.definition.name))
            .filter_map(|target| {
                let artifacts = target.status.last_success.clone()?;
                Some((target.definition.clone(), artifacts))
            })
            .collect();

        let mut actions = Vec::new();
        for (definition, artifacts) in deployed {
            let name = definition.name.clone();
            match self.probe.observe(&definition, &artifacts).await {
                Ok(observed) => {
                    lock(&self.last_errors).remove(&name);
                    let Some(target) = state.target(&name) else {
                        continue;
                    };
                    let known: BTreeMap<String, (ResourceKind, String, ResourceStatus)> = target
                        .status
                        .resources
                        .iter()
                        .map(|(key, r)| (key.clone(), (r.kind, r.name.clone(), r.status)))
                        .collect();
                    for change in resource_changes(&known, observed) {
                        debug!(target = %name, kind = %change.kind, resource = %change.name, status = ?change.status, "resource changed");
                        actions.push(Action::resource_observed(name.clone(), change));
                    }
                }
                Err(err) => actions.extend(self.report_error(&name, err.to_string())),
            }
        }
        actions
    }
}

/// Observations that differ from what is recorded. Recorded objects missing
/// from `observed` are reported gone.
fn resource_changes(
    known: &BTreeMap<String, (ResourceKind, String, ResourceStatus)>,
    observed: Vec<ResourceObservation>,
) -> Vec<ResourceObservation> {
    let mut seen = Vec::with_capacity(observed.len());
    let mut changes = Vec::new();
    for obs in observed {
        let key = format!("{}/{}", obs.kind, obs.name);
        if known.get(&key).map(|(_, _, status)| *status) != Some(obs.status) {
            changes.push(obs);
        }
        seen.push(key);
    }
    for (key, (kind, name, status)) in known {
        if *status != ResourceStatus::Gone && !seen.contains(key) {
            changes.push(ResourceObservation {
                kind: *kind,
                name: name.clone(),
                status: ResourceStatus::Gone,
            });
        }
    }
    changes
}

// ---------------------------------------------------------------------------
// StatusLogger
// ---------------------------------------------------------------------------

/// Logs target phase transitions and configuration problems.
#[derive(Default)]
pub struct StatusLogger {
    seen: Mutex<Seen>,
}

#[derive(Default)]
struct Seen {
    phases: BTreeMap<TargetName, TargetPhase>,
    config_error: Option<String>,
    warnings: usize,
}

impl StatusLogger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Subscriber for StatusLogger {
    fn name(&self) -> &'static str {
        "status-logger"
    }

    async fn on_change(&self, _store: &StoreHandle, state: Arc<EngineState>) -> Vec<Action> {
        let mut seen = lock(&self.seen);

        if state.config_error != seen.config_error {
            if let Some(err) = &state.config_error {
                warn!(error = %err, "configuration error; keeping previous targets");
            } else if seen.config_error.is_some() {
                info!("configuration reloaded");
            }
            seen.config_error = state.config_error.clone();
        }
        if state.config_warnings.len() != seen.warnings {
            for warning in &state.config_warnings {
                warn!(%warning, "configuration warning");
            }
            seen.warnings = state.config_warnings.len();
        }

        let mut phases = BTreeMap::new();
        for (name, target) in &state.targets {
            let phase = target.status.phase(state.is_building(name));
            if seen.phases.get(name) != Some(&phase) {
                match (phase, &target.status.blocked) {
                    (TargetPhase::Blocked, Some(blocked)) => {
                        warn!(target = %name, reason = %blocked.reason, message = %blocked.message, "target blocked")
                    }
                    _ => info!(target = %name, %phase, "target status"),
                }
            }
            phases.insert(name.clone(), phase);
        }
        for name in seen.phases.keys() {
            if !phases.contains_key(name) {
                info!(target = %name, "target removed");
            }
        }
        seen.phases = phases;
        Vec::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
