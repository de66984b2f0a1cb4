//! Which target builds next.
//!
//! Selection is a pure function of a snapshot and the current time, so the
//! build controller and the tests share exactly the same rules.
//!
//! A target is a candidate when all of these hold:
//!
//! - no build is in flight anywhere
//! - it is stale and not blocked
//! - its retry backoff, if any, has expired
//! - its trigger mode allows it (manual targets need a user trigger, except
//!   for their first successful build)
//! - every transitive dependency has succeeded and is not stale
//!
//! Among candidates, user-triggered targets come first (earliest trigger
//! wins), then the target that went stale first, then build order.

use chrono::{DateTime, Utc};

use devloop_core::{TargetName, TriggerMode};

use crate::action::BuildReason;
use crate::state::{EngineState, TargetState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub target: TargetName,
    pub reason: BuildReason,
}

pub fn next_target_to_build(state: &EngineState, now: DateTime<Utc>) -> Option<Selection> {
    if state.current_build.is_some() {
        return None;
    }

    state
        .targets
        .values()
        .filter(|target| is_candidate(state, target, now))
        .min_by_key(|target| {
            let status = &target.status;
            (
                status.user_triggered_at.is_none(),
                status.user_triggered_at,
                status.stale_since,
                state.order_index(&target.definition.name),
            )
        })
        .map(|target| Selection {
            target: target.definition.name.clone(),
            reason: reason_for(target),
        })
}

/// Earliest moment a backed-off target becomes eligible again.
pub fn next_retry_at(state: &EngineState) -> Option<DateTime<Utc>> {
    state
        .targets
        .values()
        .filter(|target| target.status.is_stale() && target.status.blocked.is_none())
        .filter_map(|target| target.status.retry_not_before)
        .min()
}

fn is_candidate(state: &EngineState, target: &TargetState, now: DateTime<Utc>) -> bool {
    let status = &target.status;
    if !status.is_stale() || status.blocked.is_some() {
        return false;
    }
    if status.retry_not_before.is_some_and(|at| now < at) {
        return false;
    }
    if target.definition.trigger_mode == TriggerMode::Manual
        && status.user_triggered_at.is_none()
        && status.last_success.is_some()
    {
        return false;
    }
    state
        .ancestors(&target.definition.name)
        .iter()
        .all(|dep| match state.target(dep) {
            Some(dep) => dep.status.last_success.is_some() && !dep.status.is_stale(),
            None => false,
        })
}

fn reason_for(target: &TargetState) -> BuildReason {
    let status = &target.status;
    if status.user_triggered_at.is_some() {
        BuildReason::User
    } else if status.consecutive_failures > 0 {
        BuildReason::Retry
    } else if !status.pending_files.is_empty() {
        BuildReason::FileChange
    } else if !status.pending_deps.is_empty() {
        BuildReason::Dependency
    } else {
        BuildReason::Initial
    }
}
