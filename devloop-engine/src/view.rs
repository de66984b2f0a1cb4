//! Read-only projection of [`EngineState`] for clients.
//!
//! This is what `status` returns over the control socket and what any UI
//! renders. Building a view never touches the store.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use devloop_core::{BuildResult, ResourceKind, ResourceStatus, TargetKind, TargetName};

use crate::action::BuildReason;
use crate::state::{BlockReason, Counters, EngineState, ErrorRecord, TargetPhase};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineView {
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_action_at: Option<DateTime<Utc>>,
    /// In build order.
    pub targets: Vec<TargetView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_build: Option<CurrentBuildView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent_errors: Vec<ErrorRecord>,
    pub counters: Counters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetView {
    pub name: TargetName,
    pub kind: TargetKind,
    pub phase: TargetPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<TargetName>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_files: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result: Option<BuildResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<BuildResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked: Option<BlockedView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedView {
    pub reason: BlockReason,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentBuildView {
    pub target: TargetName,
    pub reason: BuildReason,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceView {
    pub kind: ResourceKind,
    pub name: String,
    pub status: ResourceStatus,
}

impl EngineView {
    pub fn from_state(state: &EngineState) -> Self {
        let targets = state
            .build_order
            .iter()
            .filter_map(|name| state.target(name))
            .map(|target| {
                let status = &target.status;
                TargetView {
                    name: target.definition.name.clone(),
                    kind: target.definition.kind(),
                    phase: status.phase(state.is_building(&target.definition.name)),
                    deps: target.definition.deps.clone(),
                    pending_files: status.pending_files.keys().cloned().collect(),
                    last_result: status.last_result.clone(),
                    history: status.history.iter().cloned().collect(),
                    blocked: status.blocked.as_ref().map(|b| BlockedView {
                        reason: b.reason,
                        message: b.message.clone(),
                    }),
                    retry_at: status.retry_not_before,
                    resources: status
                        .resources
                        .values()
                        .map(|r| ResourceView {
                            kind: r.kind,
                            name: r.name.clone(),
                            status: r.status,
                        })
                        .collect(),
                }
            })
            .collect();

        Self {
            started_at: state.started_at,
            last_action_at: state.last_action_at,
            targets,
            current_build: state.current_build.as_ref().map(|b| CurrentBuildView {
                target: b.target.clone(),
                reason: b.reason,
                started_at: b.started_at,
            }),
            config_error: state.config_error.clone(),
            config_warnings: state.config_warnings.clone(),
            recent_errors: state.recent_errors.iter().cloned().collect(),
            counters: state.counters,
        }
    }

    pub fn target(&self, name: &str) -> Option<&TargetView> {
        self.targets.iter().find(|t| t.name.as_str() == name)
    }
}
