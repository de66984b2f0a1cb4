//! Facts that change engine state.
//!
//! Every mutation of [`crate::state::EngineState`] is an [`Action`] applied
//! by the store loop. Actions are plain values: cheap to clone, timestamped,
//! and never mutated after construction.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use devloop_core::{
    BuildResult, EngineSettings, ResourceKind, ResourceObservation, ResourceStatus,
    TargetDefinition, TargetName,
};

/// Why a build was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildReason {
    /// An explicit `devloop trigger`.
    User,
    FileChange,
    /// A dependency produced a fresh result.
    Dependency,
    /// A previous transient failure's backoff expired.
    Retry,
    /// First build after (re)configuration.
    Initial,
}

impl fmt::Display for BuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildReason::User => write!(f, "user"),
            BuildReason::FileChange => write!(f, "file_change"),
            BuildReason::Dependency => write!(f, "dependency"),
            BuildReason::Retry => write!(f, "retry"),
            BuildReason::Initial => write!(f, "initial"),
        }
    }
}

/// Component that reported an [`Action::ErrorOccurred`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    /// Manifest reload failed; also recorded as the config error.
    Config,
    Watcher,
    Monitor,
    Build,
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSource::Config => write!(f, "config"),
            ErrorSource::Watcher => write!(f, "watcher"),
            ErrorSource::Monitor => write!(f, "monitor"),
            ErrorSource::Build => write!(f, "build"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    TriggerBuild(TargetName),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    FileChanged {
        targets: Vec<TargetName>,
        paths: Vec<PathBuf>,
        at: DateTime<Utc>,
    },
    ConfigReloaded {
        targets: Vec<TargetDefinition>,
        settings: EngineSettings,
        warnings: Vec<String>,
        at: DateTime<Utc>,
    },
    BuildStarted {
        target: TargetName,
        reason: BuildReason,
        at: DateTime<Utc>,
    },
    BuildCompleted {
        target: TargetName,
        result: BuildResult,
    },
    ClusterResourceObserved {
        target: TargetName,
        kind: ResourceKind,
        name: String,
        status: ResourceStatus,
        at: DateTime<Utc>,
    },
    ErrorOccurred {
        source: ErrorSource,
        target: Option<TargetName>,
        message: String,
        at: DateTime<Utc>,
    },
    UserCommand {
        command: UserCommand,
        at: DateTime<Utc>,
    },
}

impl Action {
    pub fn file_changed(targets: Vec<TargetName>, paths: Vec<PathBuf>) -> Self {
        Action::FileChanged {
            targets,
            paths,
            at: Utc::now(),
        }
    }

    pub fn config_reloaded(
        targets: Vec<TargetDefinition>,
        settings: EngineSettings,
        warnings: Vec<String>,
    ) -> Self {
        Action::ConfigReloaded {
            targets,
            settings,
            warnings,
            at: Utc::now(),
        }
    }

    /// Start times are chosen by the build controller, so `at` is explicit.
    pub fn build_started(target: TargetName, reason: BuildReason, at: DateTime<Utc>) -> Self {
        Action::BuildStarted { target, reason, at }
    }

    pub fn build_completed(result: BuildResult) -> Self {
        Action::BuildCompleted {
            target: result.target.clone(),
            result,
        }
    }

    pub fn resource_observed(target: TargetName, observation: ResourceObservation) -> Self {
        Action::ClusterResourceObserved {
            target,
            kind: observation.kind,
            name: observation.name,
            status: observation.status,
            at: Utc::now(),
        }
    }

    pub fn error(source: ErrorSource, target: Option<TargetName>, message: impl Into<String>) -> Self {
        Action::ErrorOccurred {
            source,
            target,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn trigger(target: TargetName) -> Self {
        Action::UserCommand {
            command: UserCommand::TriggerBuild(target),
            at: Utc::now(),
        }
    }

    /// When the fact happened. A completion happened when its build finished.
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Action::FileChanged { at, .. }
            | Action::ConfigReloaded { at, .. }
            | Action::BuildStarted { at, .. }
            | Action::ClusterResourceObserved { at, .. }
            | Action::ErrorOccurred { at, .. }
            | Action::UserCommand { at, .. } => *at,
            Action::BuildCompleted { result, .. } => result.finished_at,
        }
    }

    /// Short variant name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Action::FileChanged { .. } => "FileChanged",
            Action::ConfigReloaded { .. } => "ConfigReloaded",
            Action::BuildStarted { .. } => "BuildStarted",
            Action::BuildCompleted { .. } => "BuildCompleted",
            Action::ClusterResourceObserved { .. } => "ClusterResourceObserved",
            Action::ErrorOccurred { .. } => "ErrorOccurred",
            Action::UserCommand { .. } => "UserCommand",
        }
    }

    /// The target this action is about, when there is exactly one.
    pub fn target(&self) -> Option<&TargetName> {
        match self {
            Action::BuildStarted { target, .. }
            | Action::BuildCompleted { target, .. }
            | Action::ClusterResourceObserved { target, .. } => Some(target),
            Action::ErrorOccurred { target, .. } => target.as_ref(),
            Action::UserCommand {
                command: UserCommand::TriggerBuild(target),
                ..
            } => Some(target),
            Action::FileChanged { .. } | Action::ConfigReloaded { .. } => None,
        }
    }
}
