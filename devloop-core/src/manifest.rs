//! Project manifest (`devloop.yaml`).
//!
//! # Layout
//!
//! ```text
//! <project>/
//!   devloop.yaml     (version, settings, targets)
//!   .devloop/        (runtime dir: control socket)
//! ```
//!
//! Paths inside the manifest are relative to the directory holding it.
//! [`load_at`] resolves them to absolute paths so the file watcher can
//! compare them against the absolute paths it receives.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};
use crate::graph::TargetGraph;
use crate::settings::EngineSettings;
use crate::types::{
    ImageSpec, K8sSpec, LiveUpdateSpec, LocalSpec, SyncRule, TargetDefinition, TargetKind,
    TargetName, TargetSpec, TriggerMode,
};

pub const MANIFEST_FILE: &str = "devloop.yaml";
pub const MANIFEST_VERSION: u32 = 1;

/// Root of `devloop.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    #[serde(default)]
    pub settings: EngineSettings,
    #[serde(default)]
    pub targets: Vec<TargetDefinition>,
}

/// A target list that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    /// Dependency order, dependencies first.
    pub order: Vec<TargetName>,
    /// Suspicious but legal declarations.
    pub warnings: Vec<String>,
}

impl Manifest {
    pub fn validate(&self) -> Result<Validation, ConfigError> {
        if self.version != MANIFEST_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: self.version,
                expected: MANIFEST_VERSION,
            });
        }
        validate_targets(&self.targets)
    }

    /// Rewrite every relative path as a path under `root`.
    pub fn resolve_paths(mut self, root: &Path) -> Self {
        for def in &mut self.targets {
            resolve_target(def, root);
        }
        self
    }
}

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<root>/devloop.yaml`. Pure, no I/O.
pub fn manifest_path_at(root: &Path) -> PathBuf {
    root.join(MANIFEST_FILE)
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Load and resolve the manifest at `path`.
///
/// Returns `ConfigError::NotFound` if absent, `ConfigError::Parse` (with
/// path + line context) if malformed YAML. Validation is separate: call
/// [`Manifest::validate`] on the result.
pub fn load_at(path: &Path) -> Result<Manifest, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let manifest: Manifest = serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    let root = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(manifest.resolve_paths(&root))
}

// ---------------------------------------------------------------------------
// 3. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save a manifest to `path`.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `rename`.
pub fn save_at(path: &Path, manifest: &Manifest) -> Result<(), ConfigError> {
    let tmp_path = path.with_extension("yaml.tmp");
    let yaml = serde_yaml::to_string(manifest)?;
    std::fs::write(&tmp_path, yaml).map_err(|e| io_err(&tmp_path, e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// 4. Validation
// ---------------------------------------------------------------------------

/// Check a target list: names, kind-specific fields, and the dependency DAG.
pub fn validate_targets(targets: &[TargetDefinition]) -> Result<Validation, ConfigError> {
    for def in targets {
        check_target(def)?;
    }
    let graph = TargetGraph::build(targets)?;

    let kinds: HashMap<&TargetName, TargetKind> =
        targets.iter().map(|def| (&def.name, def.kind())).collect();
    let mut warnings = Vec::new();
    for def in targets {
        if def.live_update.is_some() && def.kind() == TargetKind::Local {
            warnings.push(format!(
                "target '{}': live_update is ignored for local targets",
                def.name
            ));
        }
        if def.kind() == TargetKind::K8s
            && !def
                .deps
                .iter()
                .any(|dep| kinds.get(dep) == Some(&TargetKind::Image))
        {
            warnings.push(format!(
                "target '{}': no image target among its deps; manifests are applied as written",
                def.name
            ));
        }
        if def.watch.is_empty() && def.trigger_mode == TriggerMode::Auto && def.deps.is_empty() {
            warnings.push(format!(
                "target '{}': watches no paths and has no deps; it only builds once",
                def.name
            ));
        }
    }

    Ok(Validation {
        order: graph.topo_order().to_vec(),
        warnings,
    })
}

fn check_target(def: &TargetDefinition) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidTarget {
        target: def.name.0.clone(),
        reason: reason.to_string(),
    };
    if def.name.0.trim().is_empty() {
        return Err(invalid("name must not be empty"));
    }
    match &def.spec {
        TargetSpec::Image(spec) if spec.image.trim().is_empty() => {
            Err(invalid("image must not be empty"))
        }
        TargetSpec::K8s(spec) if spec.manifests.is_empty() => {
            Err(invalid("at least one manifest is required"))
        }
        TargetSpec::Compose(spec) if spec.service.trim().is_empty() => {
            Err(invalid("service must not be empty"))
        }
        TargetSpec::Local(spec) if spec.cmd.trim().is_empty() => {
            Err(invalid("cmd must not be empty"))
        }
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// 5. Scaffold
// ---------------------------------------------------------------------------

/// A starter manifest: one image and the Kubernetes target deploying it.
pub fn scaffold(name: &str) -> Manifest {
    let image_name = TargetName::from(format!("{name}-image"));
    Manifest {
        version: MANIFEST_VERSION,
        settings: EngineSettings::default(),
        targets: vec![
            TargetDefinition {
                name: image_name.clone(),
                spec: TargetSpec::Image(ImageSpec {
                    image: format!("localhost:5000/{name}"),
                    context: PathBuf::from("."),
                    dockerfile: None,
                    build_args: Default::default(),
                }),
                deps: vec![],
                watch: vec![PathBuf::from("src")],
                live_update: Some(LiveUpdateSpec {
                    sync: vec![SyncRule {
                        local: PathBuf::from("src"),
                        remote: PathBuf::from("/app/src"),
                    }],
                    fall_back_on: vec![],
                    run: vec![],
                }),
                trigger_mode: TriggerMode::Auto,
            },
            TargetDefinition {
                name: TargetName::from(name),
                spec: TargetSpec::K8s(K8sSpec {
                    manifests: vec![PathBuf::from("k8s/deployment.yaml")],
                }),
                deps: vec![image_name],
                watch: vec![PathBuf::from("k8s")],
                live_update: None,
                trigger_mode: TriggerMode::Auto,
            },
        ],
    }
}

fn resolve_target(def: &mut TargetDefinition, root: &Path) {
    let abs = |p: &mut PathBuf| {
        if p.is_relative() {
            *p = root.join(&*p);
        }
    };
    def.watch.iter_mut().for_each(abs);
    match &mut def.spec {
        TargetSpec::Image(spec) => {
            abs(&mut spec.context);
            if let Some(dockerfile) = spec.dockerfile.as_mut() {
                abs(dockerfile);
            }
        }
        TargetSpec::K8s(spec) => spec.manifests.iter_mut().for_each(abs),
        TargetSpec::Compose(spec) => abs(&mut spec.file),
        TargetSpec::Local(LocalSpec { workdir, .. }) => {
            if let Some(dir) = workdir.as_mut() {
                abs(dir);
            }
        }
    }
    if let Some(live) = def.live_update.as_mut() {
        live.sync.iter_mut().for_each(|rule| abs(&mut rule.local));
        live.fall_back_on.iter_mut().for_each(abs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaffold_validates_cleanly() {
        let manifest = scaffold("demo");
        let validation = manifest.validate().expect("valid");
        assert_eq!(
            validation.order,
            vec![TargetName::from("demo-image"), TargetName::from("demo")]
        );
        assert!(validation.warnings.is_empty(), "{:?}", validation.warnings);
    }

    #[test]
    fn resolve_paths_keeps_absolute_paths() {
        let mut manifest = scaffold("demo");
        manifest.targets[0].watch.push(PathBuf::from("/abs/dir"));
        let resolved = manifest.resolve_paths(Path::new("/repo"));
        assert_eq!(
            resolved.targets[0].watch,
            vec![PathBuf::from("/repo/src"), PathBuf::from("/abs/dir")]
        );
        let live = resolved.targets[0].live_update.as_ref().expect("live");
        assert_eq!(live.sync[0].local, PathBuf::from("/repo/src"));
        assert_eq!(live.sync[0].remote, PathBuf::from("/app/src"));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut manifest = scaffold("demo");
        manifest.version = 7;
        let err = manifest.validate().unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion { found: 7, .. }));
    }

    #[test]
    fn empty_local_command_is_invalid() {
        let mut manifest = scaffold("demo");
        manifest.targets.push(TargetDefinition {
            name: TargetName::from("tool"),
            spec: TargetSpec::Local(LocalSpec {
                cmd: "  ".into(),
                workdir: None,
                env: Default::default(),
            }),
            deps: vec![],
            watch: vec![],
            live_update: None,
            trigger_mode: TriggerMode::Manual,
        });
        let err = manifest.validate().unwrap_err();
        assert!(err.to_string().contains("cmd must not be empty"), "got: {err}");
    }
}
