//! Engine tuning knobs read from the `settings:` block of `devloop.yaml`.
//!
//! Every field has a default, so a manifest may omit the block entirely or
//! set only the values it cares about.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::UpdateMode;

/// Exponential retry backoff for transient build failures.
///
/// The delay for retry `n` (0-indexed) is `first × factor^n`, clamped to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub first_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            first_ms: 1_000,
            max_ms: 30_000,
            factor: 2.0,
        }
    }
}

impl BackoffSettings {
    pub fn next(&self, attempt: u32) -> Duration {
        let max = Duration::from_millis(self.max_ms);
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = Duration::from_millis(self.first_ms).as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > max.as_secs_f64() {
            max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Transient failures retried before a target needs manual intervention.
    pub max_retries: u32,
    pub backoff: BackoffSettings,
    /// Build results retained per target.
    pub history_limit: usize,
    pub update_mode: UpdateMode,
    /// Log every applied action at debug level.
    pub log_actions: bool,
    /// Quiet period before a batch of file events is dispatched.
    pub debounce_ms: u64,
    /// Path components that are never watched.
    pub ignore: Vec<String>,
    /// Interval between runtime resource status polls.
    pub resource_poll_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffSettings::default(),
            history_limit: 10,
            update_mode: UpdateMode::Auto,
            log_actions: false,
            debounce_ms: 200,
            ignore: [".git", "target", "node_modules", ".devloop"]
                .into_iter()
                .map(String::from)
                .collect(),
            resource_poll_ms: 2_000,
        }
    }
}

impl EngineSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn resource_poll_interval(&self) -> Duration {
        Duration::from_millis(self.resource_poll_ms.max(100))
    }
}
