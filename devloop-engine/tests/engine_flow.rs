//! Store, subscriber pool and build controller running together against a
//! scripted build strategy.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use devloop_build::{BuildAndDeployer, BuildError, BuildRequest, CompositeBuilder, StrategyOutcome};
use devloop_core::{
    BackoffSettings, BuildArtifacts, BuildStrategy, EngineSettings, FailureKind, LocalSpec,
    TargetDefinition, TargetName, TargetSpec, TriggerMode,
};
use devloop_engine::{
    Action, BuildController, EngineState, EngineView, ErrorSource, Store, StoreHandle,
    SubscriberPool, TargetPhase,
};

// ---------------------------------------------------------------------------
// Scripted strategy
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Behaviour {
    Succeed,
    Transient,
    /// Wait for cancellation on the first call, succeed afterwards.
    HangOnce,
}

#[derive(Debug, Clone)]
struct Call {
    target: TargetName,
    dependencies: BTreeMap<TargetName, BuildArtifacts>,
    at: DateTime<Utc>,
}

#[derive(Clone, Default)]
struct Script {
    behaviours: Arc<Mutex<BTreeMap<String, Behaviour>>>,
    calls: Arc<Mutex<Vec<Call>>>,
    hung: Arc<AtomicUsize>,
}

impl Script {
    fn with(entries: &[(&str, Behaviour)]) -> Self {
        let script = Self::default();
        {
            let mut behaviours = script.behaviours.lock().expect("behaviours");
            for (name, behaviour) in entries {
                behaviours.insert(name.to_string(), *behaviour);
            }
        }
        script
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls").clone()
    }

    fn builder(&self) -> CompositeBuilder {
        CompositeBuilder::new(vec![Box::new(self.clone())])
    }
}

#[async_trait]
impl BuildAndDeployer for Script {
    fn strategy(&self) -> BuildStrategy {
        BuildStrategy::LocalCommand
    }

    async fn build_and_deploy(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> StrategyOutcome {
        self.calls.lock().expect("calls").push(Call {
            target: request.target.name.clone(),
            dependencies: request.dependencies.clone(),
            at: Utc::now(),
        });
        let behaviour = self
            .behaviours
            .lock()
            .expect("behaviours")
            .get(request.target.name.as_str())
            .copied()
            .unwrap_or(Behaviour::Succeed);
        match behaviour {
            Behaviour::Succeed => StrategyOutcome::success(BuildArtifacts {
                image_refs: vec![format!("registry.local/{}:1", request.target.name)],
                deploy_digest: None,
            }),
            Behaviour::Transient => {
                StrategyOutcome::Fatal(BuildError::Transient("registry timed out".into()))
            }
            Behaviour::HangOnce => {
                if self.hung.fetch_add(1, Ordering::SeqCst) == 0 {
                    cancel.cancelled().await;
                    StrategyOutcome::Fatal(BuildError::Cancelled)
                } else {
                    StrategyOutcome::success(BuildArtifacts::default())
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    store: StoreHandle,
    cancel: CancellationToken,
    store_cancel: CancellationToken,
    pool: SubscriberPool,
    store_task: JoinHandle<Arc<EngineState>>,
}

impl Harness {
    fn start(script: &Script) -> Self {
        let (store, store_loop) = Store::new(EngineState::new(EngineSettings::default(), Utc::now()));
        let store_cancel = CancellationToken::new();
        let store_task = tokio::spawn(store_loop.run(store_cancel.clone()));
        let cancel = CancellationToken::new();
        let pool = SubscriberPool::spawn(
            vec![Arc::new(BuildController::with_builder(script.builder()))],
            store.clone(),
            cancel.clone(),
        );
        Self {
            store,
            cancel,
            store_cancel,
            pool,
            store_task,
        }
    }

    async fn wait_for(&self, what: &str, done: impl Fn(&EngineState) -> bool) -> Arc<EngineState> {
        let mut rx = self.store.subscribe();
        let waited = tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| done(s))).await;
        match waited {
            Ok(Ok(state)) => state.clone(),
            _ => panic!("timed out waiting for {what}"),
        }
    }

    async fn stop(self) -> Arc<EngineState> {
        self.cancel.cancel();
        self.pool.shutdown().await;
        self.store_cancel.cancel();
        self.store_task.await.expect("store task")
    }
}

fn local(name: &str, deps: &[&str]) -> TargetDefinition {
    TargetDefinition {
        name: TargetName::from(name),
        spec: TargetSpec::Local(LocalSpec {
            cmd: format!("build {name}"),
            workdir: None,
            env: Default::default(),
        }),
        deps: deps.iter().map(|d| TargetName::from(*d)).collect(),
        watch: vec![],
        live_update: None,
        trigger_mode: TriggerMode::Auto,
    }
}

fn fast_retries() -> EngineSettings {
    EngineSettings {
        max_retries: 3,
        backoff: BackoffSettings {
            first_ms: 10,
            max_ms: 40,
            factor: 2.0,
        },
        ..EngineSettings::default()
    }
}

fn settled(state: &EngineState) -> bool {
    state.current_build.is_none()
        && !state.targets.is_empty()
        && state
            .targets
            .values()
            .all(|t| t.status.last_success.is_some() && !t.status.is_stale())
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn image_builds_before_the_workload_that_uses_it() {
    let script = Script::default();
    let engine = Harness::start(&script);
    // Declared dependent-first on purpose.
    engine.store.dispatch(Action::config_reloaded(
        vec![local("web", &["web-image"]), local("web-image", &[])],
        EngineSettings::default(),
        vec![],
    ));

    let state = engine.wait_for("both targets built", settled).await;
    let calls = script.calls();
    let order: Vec<&str> = calls.iter().map(|c| c.target.as_str()).collect();
    assert_eq!(order, vec!["web-image", "web"]);
    assert_eq!(
        calls[1].dependencies[&TargetName::from("web-image")].image_refs,
        vec!["registry.local/web-image:1".to_string()]
    );

    let image = state.target(&"web-image".into()).expect("web-image");
    let web = state.target(&"web".into()).expect("web");
    let image_done = image.status.last_result.as_ref().expect("image result").finished_at;
    let web_started = web.status.last_result.as_ref().expect("web result").started_at;
    assert!(web_started > image_done, "web started after web-image finished");
    assert!(calls[0].at <= calls[1].at);

    let final_state = engine.stop().await;
    assert_eq!(final_state.counters.builds_started, 2);
    assert_eq!(final_state.counters.builds_failed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flaky_target_is_blocked_after_retry_cap_while_others_build() {
    let script = Script::with(&[("flaky", Behaviour::Transient)]);
    let engine = Harness::start(&script);
    engine.store.dispatch(Action::config_reloaded(
        vec![local("flaky", &[]), local("steady", &[])],
        fast_retries(),
        vec![],
    ));

    let state = engine
        .wait_for("flaky blocked", |s| {
            s.phase(&"flaky".into()) == Some(TargetPhase::Blocked)
                && s.target(&"steady".into())
                    .is_some_and(|t| t.status.last_success.is_some())
        })
        .await;

    let flaky = &state.target(&"flaky".into()).expect("flaky").status;
    assert_eq!(flaky.consecutive_failures, 4, "first attempt plus three retries");
    assert_eq!(flaky.history.len(), 4);
    assert!(flaky
        .history
        .iter()
        .all(|r| r.failure_kind() == Some(FailureKind::Transient)));

    let flaky_calls = script
        .calls()
        .iter()
        .filter(|c| c.target.as_str() == "flaky")
        .count();
    assert_eq!(flaky_calls, 4);

    // A user trigger lifts the block and tries again.
    engine.store.dispatch(Action::trigger("flaky".into()));
    engine
        .wait_for("flaky retried", |s| {
            s.target(&"flaky".into())
                .is_some_and(|t| t.status.history.len() >= 5)
        })
        .await;
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reload_cancels_build_of_redefined_target() {
    let script = Script::with(&[("slow", Behaviour::HangOnce)]);
    let engine = Harness::start(&script);
    engine.store.dispatch(Action::config_reloaded(
        vec![local("slow", &[])],
        EngineSettings::default(),
        vec![],
    ));
    engine
        .wait_for("slow building", |s| s.is_building(&"slow".into()))
        .await;

    let mut redefined = local("slow", &[]);
    redefined.spec = TargetSpec::Local(LocalSpec {
        cmd: "build slow --fast".into(),
        workdir: None,
        env: Default::default(),
    });
    engine.store.dispatch(Action::config_reloaded(
        vec![redefined.clone()],
        EngineSettings::default(),
        vec![],
    ));

    let state = engine.wait_for("slow rebuilt", settled).await;
    let slow = state.target(&"slow".into()).expect("slow");
    assert_eq!(slow.definition, redefined);
    let kinds: Vec<Option<FailureKind>> = slow.status.history.iter().map(|r| r.failure_kind()).collect();
    assert_eq!(kinds, vec![Some(FailureKind::Cancelled), None]);
    assert_eq!(slow.status.consecutive_failures, 0);
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshots_are_stable_between_actions() {
    let script = Script::default();
    let engine = Harness::start(&script);
    engine.store.dispatch(Action::config_reloaded(
        vec![local("a", &[]), local("b", &["a"])],
        EngineSettings::default(),
        vec![],
    ));
    engine.wait_for("settled", settled).await;

    let first = engine.store.snapshot();
    let second = engine.store.snapshot();
    assert_eq!(first, second);
    let a = serde_json::to_string(&EngineView::from_state(&first)).expect("view");
    let b = serde_json::to_string(&EngineView::from_state(&second)).expect("view");
    assert_eq!(a, b);
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_cancels_the_build_in_flight() {
    let script = Script::with(&[("slow", Behaviour::HangOnce)]);
    let engine = Harness::start(&script);
    engine.store.dispatch(Action::config_reloaded(
        vec![local("slow", &[])],
        EngineSettings::default(),
        vec![],
    ));
    engine
        .wait_for("slow building", |s| s.is_building(&"slow".into()))
        .await;

    let final_state = tokio::time::timeout(Duration::from_secs(10), engine.stop())
        .await
        .expect("shutdown does not hang");
    assert!(final_state.current_build.is_none());
    let slow = &final_state.target(&"slow".into()).expect("slow").status;
    assert_eq!(
        slow.last_result.as_ref().and_then(|r| r.failure_kind()),
        Some(FailureKind::Cancelled)
    );
    assert!(slow.is_stale(), "cancelled inputs stay pending");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backlogged_store_never_rebuilds_a_clean_target() {
    let script = Script::default();
    let engine = Harness::start(&script);
    engine.store.dispatch(Action::config_reloaded(
        vec![local("a", &[]), local("b", &["a"]), local("c", &[])],
        EngineSettings::default(),
        vec![],
    ));

    // Keep the queue long while builds start and finish, so the controller
    // keeps seeing snapshots older than its own dispatches.
    let noise = engine.store.clone();
    let flood = tokio::spawn(async move {
        for i in 0..5_000 {
            noise.dispatch(Action::error(ErrorSource::Monitor, None, format!("monitor poll {i} timed out")));
            if i % 50 == 0 {
                tokio::task::yield_now().await;
            }
        }
    });
    flood.await.expect("flood task");

    engine.wait_for("all built", settled).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    let calls = script.calls();
    let mut built: Vec<&str> = calls.iter().map(|c| c.target.as_str()).collect();
    built.sort_unstable();
    assert_eq!(built, vec!["a", "b", "c"], "each target built once");

    let final_state = engine.stop().await;
    assert_eq!(final_state.counters.builds_started, 3);
    assert_eq!(final_state.counters.builds_completed, 3);
}
