//! File watching.
//!
//! One recursive `notify` watch on the project root. Events are filtered
//! (ignore list, runtime dir), collected until the tree has been quiet for
//! the debounce window, then turned into actions:
//!
//! - manifest changed: reload it, `ConfigReloaded` or `ErrorOccurred(config)`
//! - other paths: one `FileChanged` per target whose watch paths own them

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use devloop_core::{TargetName, UpdateMode};

use crate::action::{Action, ErrorSource};
use crate::error::EngineError;
use crate::paths::is_runtime_path;
use crate::runtime::load_config;
use crate::state::EngineState;
use crate::store::StoreHandle;

/// Paths seen since the tree was last quiet.
#[derive(Debug, Default)]
pub struct Debouncer {
    paths: BTreeSet<PathBuf>,
    last_event: Option<Instant>,
}

impl Debouncer {
    pub fn push(&mut self, path: PathBuf, now: Instant) {
        self.paths.insert(path);
        self.last_event = Some(now);
    }

    /// When the current batch may be flushed, if there is one.
    pub fn deadline(&self, quiet: Duration) -> Option<Instant> {
        self.last_event.map(|at| at + quiet)
    }

    /// The batch, once `quiet` has passed without new events.
    pub fn take_if_quiet(&mut self, now: Instant, quiet: Duration) -> Option<Vec<PathBuf>> {
        match self.deadline(quiet) {
            Some(deadline) if now >= deadline => {
                self.last_event = None;
                Some(std::mem::take(&mut self.paths).into_iter().collect())
            }
            _ => None,
        }
    }
}

pub(crate) async fn watcher_task(
    root: PathBuf,
    manifest_path: PathBuf,
    update_mode: Option<UpdateMode>,
    store: StoreHandle,
    cancel: CancellationToken,
) -> Result<(), EngineError> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    watcher.watch(&root, RecursiveMode::Recursive)?;
    if let Some(dir) = manifest_path.parent().filter(|dir| !dir.starts_with(&root)) {
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
    }
    info!(root = %root.display(), "watching project");

    let mut batch = Debouncer::default();
    loop {
        let quiet = store.snapshot().settings.debounce();
        let deadline = batch.deadline(quiet);
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(error = %err, "watcher event error");
                        store.dispatch(Action::error(ErrorSource::Watcher, None, err.to_string()));
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }
                let snapshot = store.snapshot();
                for path in event.paths {
                    if path != manifest_path && is_ignored(&root, &path, &snapshot.settings.ignore) {
                        continue;
                    }
                    batch.push(path, Instant::now());
                }
            }
            _ = sleep_until(deadline) => {
                let Some(paths) = batch.take_if_quiet(Instant::now(), quiet) else { continue };
                flush(&paths, &manifest_path, update_mode, &store);
            }
        }
    }
    Ok(())
}

fn flush(
    paths: &[PathBuf],
    manifest_path: &Path,
    update_mode: Option<UpdateMode>,
    store: &StoreHandle,
) {
    let (manifest, sources): (Vec<&PathBuf>, Vec<&PathBuf>) =
        paths.iter().partition(|path| path.as_path() == manifest_path);

    if !sources.is_empty() {
        let snapshot = store.snapshot();
        let owned = owning_targets(&snapshot, sources.iter().map(|p| p.as_path()));
        if owned.is_empty() {
            debug!(paths = sources.len(), "changed paths belong to no target");
        }
        for (target, paths) in owned {
            debug!(target = %target, paths = paths.len(), "files changed");
            store.dispatch(Action::file_changed(vec![target], paths));
        }
    }

    if !manifest.is_empty() {
        match load_config(manifest_path, update_mode) {
            Ok(config) => {
                info!(targets = config.targets.len(), "manifest changed; reloading");
                store.dispatch(Action::config_reloaded(
                    config.targets,
                    config.settings,
                    config.warnings,
                ));
            }
            Err(err) => {
                warn!(error = %err, "manifest reload failed; keeping previous configuration");
                store.dispatch(Action::error(ErrorSource::Config, None, err.to_string()));
            }
        }
    }
}

/// Changed paths grouped by every target that watches them.
pub fn owning_targets<'a>(
    state: &EngineState,
    paths: impl Iterator<Item = &'a Path>,
) -> BTreeMap<TargetName, Vec<PathBuf>> {
    let mut owned: BTreeMap<TargetName, Vec<PathBuf>> = BTreeMap::new();
    for path in paths {
        for target in state.targets.values() {
            if target.definition.owns_path(path) {
                owned
                    .entry(target.definition.name.clone())
                    .or_default()
                    .push(path.to_path_buf());
            }
        }
    }
    owned
}

/// Whether any component of `path` below `root` is on the ignore list.
pub fn is_ignored(root: &Path, path: &Path, ignore: &[String]) -> bool {
    if is_runtime_path(root, path) {
        return true;
    }
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative.components().any(|component| match component {
        Component::Normal(name) => name
            .to_str()
            .is_some_and(|name| ignore.iter().any(|ignored| ignored == name)),
        _ => false,
    })
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
