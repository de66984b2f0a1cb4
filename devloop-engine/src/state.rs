//! The engine's single state aggregate.
//!
//! Only the store loop produces new [`EngineState`] values; everyone else
//! reads an `Arc<EngineState>` snapshot.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use devloop_core::{
    BuildArtifacts, BuildResult, EngineSettings, ResourceKind, ResourceStatus, TargetDefinition,
    TargetName,
};

use crate::action::{BuildReason, ErrorSource};

/// Size of the recent-errors ring.
pub const RECENT_ERRORS_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineState {
    pub targets: BTreeMap<TargetName, TargetState>,
    /// Dependencies first.
    pub build_order: Vec<TargetName>,
    pub settings: EngineSettings,
    /// The one build in flight, if any.
    pub current_build: Option<CurrentBuild>,
    /// Last rejected configuration; cleared by the next good reload.
    pub config_error: Option<String>,
    pub config_warnings: Vec<String>,
    pub recent_errors: VecDeque<ErrorRecord>,
    pub counters: Counters,
    pub started_at: DateTime<Utc>,
    pub last_action_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetState {
    pub definition: TargetDefinition,
    pub status: TargetStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TargetStatus {
    /// Changed files not yet consumed by a build, with first-seen time.
    pub pending_files: BTreeMap<PathBuf, DateTime<Utc>>,
    /// When the target first became stale; `None` when clean.
    pub stale_since: Option<DateTime<Utc>>,
    /// Dependencies that produced a fresh result since the last build.
    pub pending_deps: BTreeSet<TargetName>,
    pub user_triggered_at: Option<DateTime<Utc>>,
    pub last_result: Option<BuildResult>,
    pub last_success: Option<BuildArtifacts>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Most recent results, oldest first.
    pub history: VecDeque<BuildResult>,
    pub consecutive_failures: u32,
    pub retry_not_before: Option<DateTime<Utc>>,
    pub blocked: Option<Blocked>,
    /// Observed runtime objects keyed by `kind/name`.
    pub resources: BTreeMap<String, ObservedResource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    /// Transient failures exceeded the retry cap.
    NeedsManualIntervention,
    Fatal,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::NeedsManualIntervention => write!(f, "needs manual intervention"),
            BlockReason::Fatal => write!(f, "fatal error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blocked {
    pub reason: BlockReason,
    pub message: String,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedResource {
    pub kind: ResourceKind,
    pub name: String,
    pub status: ResourceStatus,
    pub observed_at: DateTime<Utc>,
}

/// The build in flight and the inputs it consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentBuild {
    pub target: TargetName,
    pub reason: BuildReason,
    pub started_at: DateTime<Utc>,
    pub files: BTreeMap<PathBuf, DateTime<Utc>>,
    pub deps: BTreeSet<TargetName>,
    pub user_triggered_at: Option<DateTime<Utc>>,
    pub stale_since: Option<DateTime<Utc>>,
    /// Set when a reload changed or removed the target mid-build.
    pub cancel_requested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Counters {
    pub actions_applied: u64,
    pub builds_started: u64,
    pub builds_completed: u64,
    pub builds_failed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub source: ErrorSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetName>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Derived, display-oriented phase of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetPhase {
    Idle,
    Pending,
    Building,
    Error,
    Blocked,
}

impl fmt::Display for TargetPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetPhase::Idle => write!(f, "idle"),
            TargetPhase::Pending => write!(f, "pending"),
            TargetPhase::Building => write!(f, "building"),
            TargetPhase::Error => write!(f, "error"),
            TargetPhase::Blocked => write!(f, "blocked"),
        }
    }
}

// ---------------------------------------------------------------------------
// TargetStatus
// ---------------------------------------------------------------------------

impl TargetStatus {
    /// A fresh status for a new or redefined target: stale, so it builds once.
    pub fn initial(at: DateTime<Utc>) -> Self {
        Self {
            stale_since: Some(at),
            ..Self::default()
        }
    }

    pub fn is_stale(&self) -> bool {
        self.stale_since.is_some()
    }

    pub fn mark_stale(&mut self, at: DateTime<Utc>) {
        if self.stale_since.map_or(true, |since| at < since) {
            self.stale_since = Some(at);
        }
    }

    /// Inputs changed: lift any block and forget past failures.
    pub fn reset_failures(&mut self) {
        self.blocked = None;
        self.consecutive_failures = 0;
        self.retry_not_before = None;
    }

    /// Whether the previous deploy is still up.
    ///
    /// Requires a successful build. If runtime objects were observed, none
    /// may be failed or gone and at least one must be running.
    pub fn is_live(&self) -> bool {
        if self.last_success.is_none() {
            return false;
        }
        if self.resources.is_empty() {
            return true;
        }
        let any_down = self
            .resources
            .values()
            .any(|r| matches!(r.status, ResourceStatus::Failed | ResourceStatus::Gone));
        let any_running = self
            .resources
            .values()
            .any(|r| r.status == ResourceStatus::Running);
        !any_down && any_running
    }

    /// Phase of this target, given whether it is the one building.
    pub fn phase(&self, building: bool) -> TargetPhase {
        if building {
            return TargetPhase::Building;
        }
        if self.blocked.is_some() {
            return TargetPhase::Blocked;
        }
        let failed = self.last_result.as_ref().is_some_and(|result| {
            result.failure_kind().is_some_and(|kind| kind != devloop_core::FailureKind::Cancelled)
        });
        if failed {
            TargetPhase::Error
        } else if self.is_stale() {
            TargetPhase::Pending
        } else {
            TargetPhase::Idle
        }
    }
}

// ---------------------------------------------------------------------------
// EngineState
// ---------------------------------------------------------------------------

impl EngineState {
    pub fn new(settings: EngineSettings, started_at: DateTime<Utc>) -> Self {
        Self {
            targets: BTreeMap::new(),
            build_order: Vec::new(),
            settings,
            current_build: None,
            config_error: None,
            config_warnings: Vec::new(),
            recent_errors: VecDeque::new(),
            counters: Counters::default(),
            started_at,
            last_action_at: None,
        }
    }

    pub fn target(&self, name: &TargetName) -> Option<&TargetState> {
        self.targets.get(name)
    }

    pub fn is_building(&self, name: &TargetName) -> bool {
        self.current_build
            .as_ref()
            .is_some_and(|build| &build.target == name)
    }

    pub fn phase(&self, name: &TargetName) -> Option<TargetPhase> {
        self.targets
            .get(name)
            .map(|state| state.status.phase(self.is_building(name)))
    }

    /// Position of `name` in the build order.
    pub fn order_index(&self, name: &TargetName) -> usize {
        self.build_order
            .iter()
            .position(|n| n == name)
            .unwrap_or(usize::MAX)
    }

    /// Targets that list `name` directly in their `deps`, sorted.
    pub fn direct_dependents(&self, name: &TargetName) -> Vec<TargetName> {
        self.targets
            .values()
            .filter(|state| state.definition.deps.contains(name))
            .map(|state| state.definition.name.clone())
            .collect()
    }

    /// Every target `name` depends on, directly or transitively, sorted.
    pub fn ancestors(&self, name: &TargetName) -> Vec<TargetName> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&TargetName> = match self.targets.get(name) {
            Some(state) => state.definition.deps.iter().collect(),
            None => return Vec::new(),
        };
        while let Some(dep) = stack.pop() {
            if seen.insert(dep.clone()) {
                if let Some(state) = self.targets.get(dep) {
                    stack.extend(state.definition.deps.iter());
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Latest `finished_at` of any recorded build.
    pub fn latest_completion(&self) -> Option<DateTime<Utc>> {
        self.targets
            .values()
            .filter_map(|state| state.status.last_result.as_ref())
            .map(|result| result.finished_at)
            .max()
    }

    pub fn building_count(&self) -> usize {
        usize::from(self.current_build.is_some())
    }
}
