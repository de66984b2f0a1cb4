//! The pure state transition function.
//!
//! [`reduce`] never performs I/O and never panics on bad input: an action
//! that cannot apply returns a [`ReducerError`], and the store drops it.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

use devloop_core::{manifest, BuildResult, EngineSettings, FailureKind, TargetDefinition, TargetName};

use crate::action::{Action, ErrorSource, UserCommand};
use crate::state::{
    BlockReason, Blocked, CurrentBuild, EngineState, ErrorRecord, ObservedResource, TargetState,
    TargetStatus, RECENT_ERRORS_LIMIT,
};

/// An action that does not fit the current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReducerError {
    #[error("unknown target '{0}'")]
    UnknownTarget(TargetName),

    #[error("cannot start '{requested}': '{building}' is already building")]
    BuildInFlight {
        building: TargetName,
        requested: TargetName,
    },

    #[error("no build of '{0}' is in flight")]
    NoMatchingBuild(TargetName),
}

/// Apply `action` to `state`, returning the next state.
pub fn reduce(state: &EngineState, action: &Action) -> Result<EngineState, ReducerError> {
    let mut next = state.clone();
    match action {
        Action::FileChanged { targets, paths, at } => {
            file_changed(&mut next, targets, paths, *at)?
        }
        Action::ConfigReloaded {
            targets,
            settings,
            warnings,
            at,
        } => config_reloaded(&mut next, targets, settings, warnings, *at),
        Action::BuildStarted { target, reason, at } => {
            if let Some(current) = &next.current_build {
                return Err(ReducerError::BuildInFlight {
                    building: current.target.clone(),
                    requested: target.clone(),
                });
            }
            let status = status_mut(&mut next, target)?;
            let build = CurrentBuild {
                target: target.clone(),
                reason: *reason,
                started_at: *at,
                files: std::mem::take(&mut status.pending_files),
                deps: std::mem::take(&mut status.pending_deps),
                user_triggered_at: status.user_triggered_at.take(),
                stale_since: status.stale_since.take(),
                cancel_requested: false,
            };
            status.retry_not_before = None;
            next.current_build = Some(build);
            next.counters.builds_started += 1;
        }
        Action::BuildCompleted { target, result } => build_completed(&mut next, target, result)?,
        Action::ClusterResourceObserved {
            target,
            kind,
            name,
            status,
            at,
        } => {
            let target_status = status_mut(&mut next, target)?;
            target_status.resources.insert(
                format!("{kind}/{name}"),
                ObservedResource {
                    kind: *kind,
                    name: name.clone(),
                    status: *status,
                    observed_at: *at,
                },
            );
        }
        Action::ErrorOccurred {
            source,
            target,
            message,
            at,
        } => {
            if *source == ErrorSource::Config {
                next.config_error = Some(message.clone());
            }
            push_error(&mut next, *source, target.clone(), message.clone(), *at);
        }
        Action::UserCommand {
            command: UserCommand::TriggerBuild(target),
            at,
        } => {
            let status = status_mut(&mut next, target)?;
            if status.user_triggered_at.is_none() {
                status.user_triggered_at = Some(*at);
            }
            status.mark_stale(*at);
            status.reset_failures();
        }
    }

    next.counters.actions_applied += 1;
    next.last_action_at = Some(action.at());
    Ok(next)
}

// ---------------------------------------------------------------------------
// Individual transitions
// ---------------------------------------------------------------------------

fn file_changed(
    state: &mut EngineState,
    targets: &[TargetName],
    paths: &[std::path::PathBuf],
    at: DateTime<Utc>,
) -> Result<(), ReducerError> {
    if let Some(unknown) = targets.iter().find(|t| !state.targets.contains_key(*t)) {
        return Err(ReducerError::UnknownTarget(unknown.clone()));
    }
    for target in targets {
        let status = status_mut(state, target)?;
        for path in paths {
            status.pending_files.entry(path.clone()).or_insert(at);
        }
        status.mark_stale(at);
        // A fatal block waits for a new definition or an explicit trigger.
        let fatal = status
            .blocked
            .as_ref()
            .is_some_and(|blocked| blocked.reason == BlockReason::Fatal);
        if !fatal {
            status.reset_failures();
        }
    }
    Ok(())
}

fn config_reloaded(
    state: &mut EngineState,
    targets: &[TargetDefinition],
    settings: &EngineSettings,
    warnings: &[String],
    at: DateTime<Utc>,
) {
    let validation = match manifest::validate_targets(targets) {
        Ok(validation) => validation,
        Err(err) => {
            let message = format!("configuration rejected: {err}");
            state.config_error = Some(message.clone());
            push_error(state, ErrorSource::Config, None, message, at);
            return;
        }
    };

    if let Some(build) = state.current_build.as_mut() {
        let old = state.targets.get(&build.target).map(|t| &t.definition);
        let new = targets.iter().find(|def| def.name == build.target);
        if old != new {
            build.cancel_requested = true;
        }
    }

    let mut previous = std::mem::take(&mut state.targets);
    let mut next = BTreeMap::new();
    for def in targets {
        let kept = previous
            .remove(&def.name)
            .filter(|old| old.definition == *def);
        let target_state = kept.unwrap_or_else(|| TargetState {
            definition: def.clone(),
            status: TargetStatus::initial(at),
        });
        next.insert(def.name.clone(), target_state);
    }
    for target_state in next.values_mut() {
        let deps = &target_state.definition.deps;
        target_state.status.pending_deps.retain(|dep| deps.contains(dep));
    }

    let mut all_warnings = validation.warnings;
    for warning in warnings {
        if !all_warnings.contains(warning) {
            all_warnings.push(warning.clone());
        }
    }

    state.targets = next;
    state.build_order = validation.order;
    state.settings = settings.clone();
    state.config_warnings = all_warnings;
    state.config_error = None;
}

fn build_completed(
    state: &mut EngineState,
    target: &TargetName,
    result: &BuildResult,
) -> Result<(), ReducerError> {
    let build = match state.current_build.take() {
        Some(build) if &build.target == target => build,
        other => {
            state.current_build = other;
            return Err(ReducerError::NoMatchingBuild(target.clone()));
        }
    };
    state.counters.builds_completed += 1;
    let failure = result.failure_kind();
    if matches!(failure, Some(FailureKind::Transient | FailureKind::Fatal)) {
        state.counters.builds_failed += 1;
    }

    let settings = state.settings.clone();
    let finished_at = result.finished_at;
    let dependents = state.direct_dependents(target);
    let Some(target_state) = state.targets.get_mut(target) else {
        // Removed by a reload while building.
        return Ok(());
    };
    let status = &mut target_state.status;

    let in_order = status
        .history
        .back()
        .map_or(true, |last| last.finished_at <= finished_at);
    if in_order {
        status.history.push_back(result.clone());
        while status.history.len() > settings.history_limit.max(1) {
            status.history.pop_front();
        }
    }
    status.last_result = Some(result.clone());

    match failure {
        None => {
            status.last_success = Some(result.artifacts.clone());
            status.last_success_at = Some(finished_at);
            status.reset_failures();
            // Observations describe the previous deploy.
            status.resources.clear();
        }
        Some(FailureKind::Transient) => {
            restore_inputs(status, build);
            status.consecutive_failures += 1;
            if status.consecutive_failures > settings.max_retries {
                status.retry_not_before = None;
                status.blocked = Some(Blocked {
                    reason: BlockReason::NeedsManualIntervention,
                    message: failure_message(result),
                    since: finished_at,
                });
            } else {
                let delay = settings.backoff.next(status.consecutive_failures - 1);
                let delay = TimeDelta::from_std(delay).unwrap_or(TimeDelta::zero());
                status.retry_not_before = Some(finished_at + delay);
            }
        }
        Some(FailureKind::Fatal) => {
            restore_inputs(status, build);
            status.blocked = Some(Blocked {
                reason: BlockReason::Fatal,
                message: failure_message(result),
                since: finished_at,
            });
        }
        Some(FailureKind::Cancelled) => restore_inputs(status, build),
    }

    if failure.is_none() {
        for dependent in dependents {
            if let Some(dep_state) = state.targets.get_mut(&dependent) {
                dep_state.status.pending_deps.insert(target.clone());
                dep_state.status.mark_stale(finished_at);
            }
        }
    }

    if !in_order {
        let message = format!(
            "result for '{target}' finished before the last recorded build; not added to history"
        );
        push_error(state, ErrorSource::Build, Some(target.clone()), message, finished_at);
    }
    Ok(())
}

/// Put the inputs a failed build consumed back, so the target stays stale.
fn restore_inputs(status: &mut TargetStatus, build: CurrentBuild) {
    for (path, seen) in build.files {
        let entry = status.pending_files.entry(path).or_insert(seen);
        if seen < *entry {
            *entry = seen;
        }
    }
    status.pending_deps.extend(build.deps);
    status.user_triggered_at = match (status.user_triggered_at, build.user_triggered_at) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    status.mark_stale(build.stale_since.unwrap_or(build.started_at));
}

fn failure_message(result: &BuildResult) -> String {
    result
        .failure
        .as_ref()
        .map(|f| f.message.clone())
        .unwrap_or_default()
}

fn push_error(
    state: &mut EngineState,
    source: ErrorSource,
    target: Option<TargetName>,
    message: String,
    at: DateTime<Utc>,
) {
    state.recent_errors.push_back(ErrorRecord {
        source,
        target,
        message,
        at,
    });
    while state.recent_errors.len() > RECENT_ERRORS_LIMIT {
        state.recent_errors.pop_front();
    }
}

fn status_mut<'a>(
    state: &'a mut EngineState,
    target: &TargetName,
) -> Result<&'a mut TargetStatus, ReducerError> {
    state
        .targets
        .get_mut(target)
        .map(|target_state| &mut target_state.status)
        .ok_or_else(|| ReducerError::UnknownTarget(target.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::BuildReason;
    use crate::buildcontrol::next_target_to_build;
    use devloop_core::{
        BuildArtifacts, BuildFailure, BuildStrategy, LocalSpec, TargetSpec, TriggerMode,
    };
    use std::path::PathBuf;

    fn def(name: &str, deps: &[&str]) -> TargetDefinition {
        TargetDefinition {
            name: TargetName::from(name),
            spec: TargetSpec::Local(LocalSpec {
                cmd: format!("make {name}"),
                workdir: None,
                env: Default::default(),
            }),
            deps: deps.iter().map(|d| TargetName::from(*d)).collect(),
            watch: vec![PathBuf::from(format!("/p/{name}"))],
            live_update: None,
            trigger_mode: TriggerMode::Auto,
        }
    }

    fn loaded(defs: Vec<TargetDefinition>) -> (EngineState, DateTime<Utc>) {
        let t0 = Utc::now();
        let state = EngineState::new(EngineSettings::default(), t0);
        let reload = Action::ConfigReloaded {
            targets: defs,
            settings: EngineSettings::default(),
            warnings: vec![],
            at: t0,
        };
        (reduce(&state, &reload).expect("reload"), t0)
    }

    fn result(
        target: &str,
        started_at: DateTime<Utc>,
        secs: i64,
        failure: Option<FailureKind>,
    ) -> BuildResult {
        BuildResult {
            target: target.into(),
            strategy: Some(BuildStrategy::LocalCommand),
            artifacts: BuildArtifacts::default(),
            started_at,
            finished_at: started_at + TimeDelta::seconds(secs),
            duration_ms: u64::try_from(secs * 1000).unwrap_or_default(),
            warnings: vec![],
            failure: failure.map(|kind| BuildFailure {
                kind,
                message: format!("{kind} failure"),
            }),
        }
    }

    fn start(state: &EngineState, target: &str, at: DateTime<Utc>) -> EngineState {
        reduce(state, &Action::build_started(target.into(), BuildReason::Initial, at))
            .expect("start")
    }

    fn complete(state: &EngineState, result: BuildResult) -> EngineState {
        reduce(state, &Action::build_completed(result)).expect("complete")
    }

    fn status<'a>(state: &'a EngineState, name: &str) -> &'a TargetStatus {
        &state.target(&name.into()).expect("target").status
    }

    #[test]
    fn reload_marks_new_targets_stale_in_build_order() {
        let (state, t0) = loaded(vec![def("web", &["web-image"]), def("web-image", &[])]);
        assert_eq!(state.build_order, vec![TargetName::from("web-image"), "web".into()]);
        assert_eq!(status(&state, "web").stale_since, Some(t0));
        assert_eq!(state.counters.actions_applied, 1);
        assert_eq!(state.last_action_at, Some(t0));
    }

    #[test]
    fn rejected_reload_keeps_previous_targets() {
        let (state, _) = loaded(vec![def("a", &[])]);
        let bad = Action::config_reloaded(
            vec![def("a", &["b"]), def("b", &["a"])],
            EngineSettings::default(),
            vec![],
        );
        let next = reduce(&state, &bad).expect("applied");
        assert_eq!(next.targets, state.targets);
        assert!(next
            .config_error
            .as_deref()
            .is_some_and(|e| e.starts_with("configuration rejected")));
        assert_eq!(next.recent_errors.back().map(|e| e.source), Some(ErrorSource::Config));

        let good = Action::config_reloaded(vec![def("a", &[])], EngineSettings::default(), vec![]);
        assert_eq!(reduce(&next, &good).expect("good").config_error, None);
    }

    #[test]
    fn reload_keeps_unchanged_status_and_flags_redefined_build() {
        let (state, t0) = loaded(vec![def("a", &[]), def("b", &[])]);
        let built = complete(&start(&state, "a", t0), result("a", t0, 1, None));
        let building = start(&built, "b", t0 + TimeDelta::seconds(2));

        let mut changed_b = def("b", &[]);
        changed_b.spec = TargetSpec::Local(LocalSpec {
            cmd: "make other".into(),
            workdir: None,
            env: Default::default(),
        });
        let next = reduce(
            &building,
            &Action::config_reloaded(vec![def("a", &[]), changed_b], EngineSettings::default(), vec![]),
        )
        .expect("reload");

        assert!(status(&next, "a").last_success.is_some(), "unchanged target keeps status");
        assert!(next.current_build.as_ref().is_some_and(|b| b.cancel_requested));
        assert!(status(&next, "b").is_stale());
    }

    #[test]
    fn unknown_targets_are_rejected() {
        let (state, _) = loaded(vec![def("a", &[])]);
        let err = reduce(
            &state,
            &Action::file_changed(vec!["a".into(), "ghost".into()], vec![PathBuf::from("/p/a/x")]),
        )
        .expect_err("unknown");
        assert_eq!(err, ReducerError::UnknownTarget("ghost".into()));
        assert!(reduce(&state, &Action::trigger("ghost".into())).is_err());
    }

    #[test]
    fn only_one_build_in_flight() {
        let (state, t0) = loaded(vec![def("a", &[]), def("b", &[])]);
        let building = start(&state, "a", t0);
        let err = reduce(&building, &Action::build_started("b".into(), BuildReason::Initial, t0))
            .expect_err("second start");
        assert!(matches!(err, ReducerError::BuildInFlight { .. }));

        let err = reduce(&building, &Action::build_completed(result("b", t0, 1, None)))
            .expect_err("wrong target");
        assert_eq!(err, ReducerError::NoMatchingBuild("b".into()));
    }

    #[test]
    fn success_cascades_to_direct_dependents() {
        let (state, t0) = loaded(vec![def("img", &[]), def("app", &["img"]), def("e2e", &["app"])]);
        let mut state = state;
        for name in ["img", "app", "e2e"] {
            state = complete(&start(&state, name, t0), result(name, t0, 1, None));
        }
        assert!(state.targets.values().all(|t| !t.status.is_stale()));

        let changed = reduce(
            &state,
            &Action::file_changed(vec!["img".into()], vec![PathBuf::from("/p/img/Dockerfile")]),
        )
        .expect("change");
        let t1 = t0 + TimeDelta::seconds(10);
        let rebuilt = complete(&start(&changed, "img", t1), result("img", t1, 2, None));

        assert!(status(&rebuilt, "app").pending_deps.contains(&TargetName::from("img")));
        assert!(status(&rebuilt, "app").is_stale());
        assert!(!status(&rebuilt, "e2e").is_stale(), "cascade is one level at a time");
    }

    #[test]
    fn transient_failures_back_off_then_block() {
        let (state, t0) = loaded(vec![def("flaky", &[])]);
        let mut state = state;
        let mut at = t0;
        for attempt in 1..=3u32 {
            state = complete(&start(&state, "flaky", at), result("flaky", at, 1, Some(FailureKind::Transient)));
            let s = status(&state, "flaky");
            assert_eq!(s.consecutive_failures, attempt);
            assert!(s.is_stale(), "inputs restored");
            let expected = at + TimeDelta::seconds(1) + TimeDelta::seconds(1 << (attempt - 1));
            assert_eq!(s.retry_not_before, Some(expected));
            assert!(s.blocked.is_none());
            at = expected;
        }

        state = complete(&start(&state, "flaky", at), result("flaky", at, 1, Some(FailureKind::Transient)));
        let s = status(&state, "flaky");
        assert_eq!(
            s.blocked.as_ref().map(|b| b.reason),
            Some(BlockReason::NeedsManualIntervention)
        );
        assert_eq!(state.phase(&"flaky".into()), Some(crate::state::TargetPhase::Blocked));

        let unblocked = reduce(&state, &Action::trigger("flaky".into())).expect("trigger");
        let s = status(&unblocked, "flaky");
        assert!(s.blocked.is_none());
        assert_eq!(s.consecutive_failures, 0);
        assert!(s.user_triggered_at.is_some());
    }

    #[test]
    fn fatal_blocks_and_cancel_restores_without_penalty() {
        let (state, t0) = loaded(vec![def("a", &[]), def("b", &[])]);
        let changed = reduce(
            &state,
            &Action::file_changed(vec!["a".into()], vec![PathBuf::from("/p/a/main.c")]),
        )
        .expect("change");

        let cancelled = complete(&start(&changed, "a", t0), result("a", t0, 1, Some(FailureKind::Cancelled)));
        let a = status(&cancelled, "a");
        assert_eq!(a.consecutive_failures, 0);
        assert!(a.blocked.is_none());
        assert!(a.pending_files.contains_key(&PathBuf::from("/p/a/main.c")));
        assert_eq!(a.stale_since, Some(t0));

        let t1 = t0 + TimeDelta::seconds(5);
        let fatal = complete(&start(&cancelled, "a", t1), result("a", t1, 1, Some(FailureKind::Fatal)));
        let a = status(&fatal, "a");
        assert_eq!(a.blocked.as_ref().map(|b| b.reason), Some(BlockReason::Fatal));
        assert_eq!(fatal.counters.builds_failed, 1);
        assert_eq!(fatal.counters.builds_completed, 2);
    }

    #[test]
    fn fatal_block_survives_file_changes_until_redefined_or_triggered() {
        let (state, t0) = loaded(vec![def("a", &[])]);
        let fatal = complete(&start(&state, "a", t0), result("a", t0, 1, Some(FailureKind::Fatal)));
        let later = t0 + TimeDelta::seconds(30);
        assert!(next_target_to_build(&fatal, later).is_none());

        let edited = reduce(
            &fatal,
            &Action::file_changed(vec!["a".into()], vec![PathBuf::from("/p/a/main.c")]),
        )
        .expect("change");
        let a = status(&edited, "a");
        assert_eq!(a.blocked.as_ref().map(|b| b.reason), Some(BlockReason::Fatal));
        assert!(a.pending_files.contains_key(&PathBuf::from("/p/a/main.c")));
        assert!(next_target_to_build(&edited, later).is_none());

        // Same definition reloaded: still blocked.
        let reloaded = reduce(
            &edited,
            &Action::config_reloaded(vec![def("a", &[])], EngineSettings::default(), vec![]),
        )
        .expect("reload");
        assert!(status(&reloaded, "a").blocked.is_some());

        let mut fixed = def("a", &[]);
        fixed.watch.push(PathBuf::from("/p/shared"));
        let redefined = reduce(
            &edited,
            &Action::config_reloaded(vec![fixed], EngineSettings::default(), vec![]),
        )
        .expect("reload");
        assert!(status(&redefined, "a").blocked.is_none());
        assert_eq!(
            next_target_to_build(&redefined, later).map(|s| s.target),
            Some("a".into())
        );

        let triggered = reduce(&edited, &Action::trigger("a".into())).expect("trigger");
        assert!(status(&triggered, "a").blocked.is_none());
        assert!(next_target_to_build(&triggered, later).is_some());
    }

    #[test]
    fn file_change_lifts_a_retry_cap_block() {
        let (state, t0) = loaded(vec![def("flaky", &[])]);
        let mut state = state;
        let mut at = t0;
        for _ in 0..4 {
            state = complete(&start(&state, "flaky", at), result("flaky", at, 1, Some(FailureKind::Transient)));
            at += TimeDelta::minutes(1);
        }
        assert_eq!(
            status(&state, "flaky").blocked.as_ref().map(|b| b.reason),
            Some(BlockReason::NeedsManualIntervention)
        );
        let edited = reduce(
            &state,
            &Action::file_changed(vec!["flaky".into()], vec![PathBuf::from("/p/flaky/lib.rs")]),
        )
        .expect("change");
        let s = status(&edited, "flaky");
        assert!(s.blocked.is_none());
        assert_eq!(s.consecutive_failures, 0);
    }

    #[test]
    fn history_is_bounded_and_ordered() {
        let (state, t0) = loaded(vec![def("a", &[])]);
        let mut state = state;
        for i in 0..15 {
            let at = t0 + TimeDelta::seconds(i * 10);
            state = complete(&start(&state, "a", at), result("a", at, 1, None));
        }
        let history = &status(&state, "a").history;
        assert_eq!(history.len(), EngineSettings::default().history_limit);
        assert!(history
            .iter()
            .zip(history.iter().skip(1))
            .all(|(a, b)| a.finished_at <= b.finished_at));

        let late = t0 + TimeDelta::seconds(1000);
        let early = t0 - TimeDelta::seconds(1000);
        let out_of_order = complete(&start(&state, "a", late), result("a", early, 1, None));
        assert_eq!(status(&out_of_order, "a").history, *history);
        assert!(out_of_order.current_build.is_none());
        assert_eq!(
            out_of_order.recent_errors.back().map(|e| e.source),
            Some(ErrorSource::Build)
        );
    }

    #[test]
    fn completion_for_removed_target_only_clears_the_build() {
        let (state, t0) = loaded(vec![def("a", &[]), def("b", &[])]);
        let building = start(&state, "b", t0);
        let removed = reduce(
            &building,
            &Action::config_reloaded(vec![def("a", &[])], EngineSettings::default(), vec![]),
        )
        .expect("reload");
        let done = complete(&removed, result("b", t0, 1, Some(FailureKind::Cancelled)));
        assert!(done.current_build.is_none());
        assert!(done.target(&"b".into()).is_none());
    }
}
