use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use devloop_build::{cli_capabilities, Capabilities};
use devloop_core::{manifest, ConfigError, EngineSettings, TargetDefinition, UpdateMode};

use crate::action::Action;
use crate::controller::BuildController;
use crate::error::{io_err, EngineError};
use crate::monitor::{ResourceMonitor, StatusLogger};
use crate::paths::{runtime_dir, socket_path};
use crate::server::socket_server_task;
use crate::state::EngineState;
use crate::store::Store;
use crate::subscriber::{Subscriber, SubscriberPool};
use crate::watcher::watcher_task;

/// How to start an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub project_root: PathBuf,
    /// Defaults to `<project_root>/devloop.yaml`.
    pub manifest_path: Option<PathBuf>,
    /// Overrides `settings.update_mode` from the manifest.
    pub update_mode: Option<UpdateMode>,
}

impl EngineOptions {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            manifest_path: None,
            update_mode: None,
        }
    }
}

/// A manifest that loaded and validated.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedConfig {
    pub targets: Vec<TargetDefinition>,
    pub settings: EngineSettings,
    pub warnings: Vec<String>,
}

/// Load and validate the manifest at `path`, applying the CLI override.
pub fn load_config(
    path: &Path,
    update_mode: Option<UpdateMode>,
) -> Result<LoadedConfig, ConfigError> {
    let loaded = manifest::load_at(path)?;
    let validation = loaded.validate()?;
    let mut settings = loaded.settings;
    if let Some(mode) = update_mode {
        settings.update_mode = mode;
    }
    Ok(LoadedConfig {
        targets: loaded.targets,
        settings,
        warnings: validation.warnings,
    })
}

/// Start the engine with the real Docker/kubectl/shell clients and block
/// the current thread until it exits.
pub fn start_blocking(options: EngineOptions) -> Result<(), EngineError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(async move {
        let caps = cli_capabilities(&options.project_root);
        run(options, caps, CancellationToken::new()).await.map(|_| ())
    })
}

/// Run the engine until `cancel` fires, a `stop` request arrives or ctrl-c.
/// Returns the final state.
///
/// A bad manifest is fatal here only; later reloads that fail keep the
/// engine running on the previous configuration.
pub async fn run(
    options: EngineOptions,
    caps: Capabilities,
    cancel: CancellationToken,
) -> Result<Arc<EngineState>, EngineError> {
    let root = fs::canonicalize(&options.project_root)
        .map_err(|e| io_err(&options.project_root, e))?;
    let manifest_path = match &options.manifest_path {
        Some(path) => fs::canonicalize(path).map_err(|e| io_err(path, e))?,
        None => manifest::manifest_path_at(&root),
    };
    let config = load_config(&manifest_path, options.update_mode)?;
    let runtime = runtime_dir(&root);
    fs::create_dir_all(&runtime).map_err(|e| io_err(&runtime, e))?;

    info!(
        root = %root.display(),
        targets = config.targets.len(),
        update_mode = %config.settings.update_mode,
        "starting engine"
    );

    let poll = config.settings.resource_poll_interval();
    let (store, store_loop) = Store::new(EngineState::new(config.settings.clone(), Utc::now()));
    store.dispatch(Action::config_reloaded(
        config.targets,
        config.settings,
        config.warnings,
    ));

    // The store outlives the subscribers so a cancelled build's completion
    // is still applied.
    let store_cancel = CancellationToken::new();
    let store_handle = tokio::spawn(store_loop.run(store_cancel.clone()));

    let subscribers: Vec<Arc<dyn Subscriber>> = vec![
        Arc::new(BuildController::new(caps.clone())),
        Arc::new(ResourceMonitor::new(caps.probe.clone(), poll)),
        Arc::new(StatusLogger::new()),
    ];
    let pool = SubscriberPool::spawn(subscribers, store.clone(), cancel.clone());

    let watcher_handle = {
        let cancel = cancel.clone();
        let store = store.clone();
        let root = root.clone();
        let update_mode = options.update_mode;
        tokio::spawn(async move {
            let result = watcher_task(root, manifest_path, update_mode, store, cancel.clone()).await;
            cancel.cancel();
            result
        })
    };

    let socket_handle = {
        let cancel = cancel.clone();
        let store = store.clone();
        let socket = socket_path(&root);
        tokio::spawn(async move {
            let result = socket_server_task(socket, store, cancel.clone()).await;
            cancel.cancel();
            result
        })
    };

    let signal_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            info!("received ctrl-c, shutting down engine");
                            cancel.cancel();
                            Ok(())
                        }
                        Err(err) => {
                            cancel.cancel();
                            Err(EngineError::Protocol(format!("ctrl-c handler failed: {err}")))
                        }
                    }
                }
            }
        })
    };

    let (watcher_result, socket_result, signal_result) =
        tokio::join!(watcher_handle, socket_handle, signal_handle);

    pool.shutdown().await;
    store_cancel.cancel();
    let final_state = store_handle
        .await
        .map_err(|err| EngineError::Protocol(format!("store task join failure: {err}")))?;

    handle_join("watcher", watcher_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    info!(
        builds = final_state.counters.builds_completed,
        failed = final_state.counters.builds_failed,
        "engine stopped"
    );
    Ok(final_state)
}

fn handle_join(
    task: &str,
    result: Result<Result<(), EngineError>, tokio::task::JoinError>,
) -> Result<(), EngineError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(EngineError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
