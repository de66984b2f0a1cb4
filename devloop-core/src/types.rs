//! Domain types for devloop targets and build results.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.
//! All types are serializable/deserializable via serde + serde_yaml.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed name for a target declared in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetName(pub String);

impl TargetName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for TargetName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TargetName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The category of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Image,
    K8s,
    Compose,
    Local,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Image => write!(f, "image"),
            TargetKind::K8s => write!(f, "k8s"),
            TargetKind::Compose => write!(f, "compose"),
            TargetKind::Local => write!(f, "local"),
        }
    }
}

/// When a target is allowed to build automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// File changes schedule a build.
    #[default]
    Auto,
    /// Only the initial build and explicit user triggers schedule a build.
    Manual,
}

/// Which strategies the engine may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    /// Prefer in-place updates, fall back to full builds.
    #[default]
    Auto,
    /// Always rebuild images; never update containers in place.
    Image,
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateMode::Auto => write!(f, "auto"),
            UpdateMode::Image => write!(f, "image"),
        }
    }
}

/// One concrete method of turning a target's inputs into a deployed artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildStrategy {
    #[serde(rename = "live-update")]
    LiveUpdate,
    #[serde(rename = "full-image-build")]
    ImageBuild,
    #[serde(rename = "compose-build")]
    ComposeBuild,
    #[serde(rename = "local-command")]
    LocalCommand,
}

impl fmt::Display for BuildStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildStrategy::LiveUpdate => write!(f, "live-update"),
            BuildStrategy::ImageBuild => write!(f, "full-image-build"),
            BuildStrategy::ComposeBuild => write!(f, "compose-build"),
            BuildStrategy::LocalCommand => write!(f, "local-command"),
        }
    }
}

/// Classification of a failed build attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Retried with backoff, bounded attempts.
    Transient,
    /// Target is blocked until its definition or inputs change.
    Fatal,
    /// The attempt was cancelled; not counted against the target.
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Fatal => write!(f, "fatal"),
            FailureKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Kind of a runtime object observed for a deployed target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Pod,
    Service,
    Container,
    Process,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Pod => write!(f, "pod"),
            ResourceKind::Service => write!(f, "service"),
            ResourceKind::Container => write!(f, "container"),
            ResourceKind::Process => write!(f, "process"),
        }
    }
}

/// Last observed status of a runtime object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// The object no longer exists.
    Gone,
}

impl ResourceStatus {
    pub fn is_healthy(self) -> bool {
        matches!(self, ResourceStatus::Running | ResourceStatus::Succeeded)
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceStatus::Pending => write!(f, "pending"),
            ResourceStatus::Running => write!(f, "running"),
            ResourceStatus::Succeeded => write!(f, "succeeded"),
            ResourceStatus::Failed => write!(f, "failed"),
            ResourceStatus::Gone => write!(f, "gone"),
        }
    }
}

/// One runtime object reported by a probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceObservation {
    pub kind: ResourceKind,
    pub name: String,
    pub status: ResourceStatus,
}

// ---------------------------------------------------------------------------
// Target definitions
// ---------------------------------------------------------------------------

/// A container image built from a Dockerfile and pushed to a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    /// Image reference without tag, e.g. `registry.local/web`.
    pub image: String,
    /// Build context directory.
    #[serde(default = "default_context")]
    pub context: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub build_args: BTreeMap<String, String>,
}

/// Kubernetes manifests applied to the current cluster.
///
/// Image references inside the manifests are rewritten to the refs produced
/// by the image targets this target depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct K8sSpec {
    pub manifests: Vec<PathBuf>,
}

/// A single service of a Compose project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeSpec {
    pub file: PathBuf,
    pub service: String,
}

/// A shell command run on the developer's machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSpec {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// Kind-specific build spec. Serialized inline with a `kind` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TargetSpec {
    Image(ImageSpec),
    K8s(K8sSpec),
    Compose(ComposeSpec),
    Local(LocalSpec),
}

impl TargetSpec {
    pub fn kind(&self) -> TargetKind {
        match self {
            TargetSpec::Image(_) => TargetKind::Image,
            TargetSpec::K8s(_) => TargetKind::K8s,
            TargetSpec::Compose(_) => TargetKind::Compose,
            TargetSpec::Local(_) => TargetKind::Local,
        }
    }
}

/// Copies a local path into the running container at `remote`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRule {
    pub local: PathBuf,
    pub remote: PathBuf,
}

/// Rules for updating a running container in place instead of rebuilding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LiveUpdateSpec {
    #[serde(default)]
    pub sync: Vec<SyncRule>,
    /// Changes under these paths always force a full rebuild.
    #[serde(default)]
    pub fall_back_on: Vec<PathBuf>,
    /// Commands run inside the container after files are synced.
    #[serde(default)]
    pub run: Vec<String>,
}

impl LiveUpdateSpec {
    /// The sync rule covering `path`, if any.
    pub fn rule_for(&self, path: &Path) -> Option<&SyncRule> {
        self.sync.iter().find(|rule| path.starts_with(&rule.local))
    }

    pub fn forces_fallback(&self, path: &Path) -> bool {
        self.fall_back_on.iter().any(|prefix| path.starts_with(prefix))
    }
}

/// A named, independently buildable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDefinition {
    pub name: TargetName,
    #[serde(flatten)]
    pub spec: TargetSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<TargetName>,
    /// Source paths owned by this target; changes below them mark it stale.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub watch: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_update: Option<LiveUpdateSpec>,
    #[serde(default)]
    pub trigger_mode: TriggerMode,
}

impl TargetDefinition {
    pub fn kind(&self) -> TargetKind {
        self.spec.kind()
    }

    /// Whether `path` falls under one of the target's watched paths.
    pub fn owns_path(&self, path: &Path) -> bool {
        self.watch.iter().any(|root| path.starts_with(root))
    }
}

// ---------------------------------------------------------------------------
// Build results
// ---------------------------------------------------------------------------

/// What a successful build produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BuildArtifacts {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_digest: Option<String>,
}

/// Terminal error of a build attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Outcome of one build attempt, appended to the target's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub target: TargetName,
    /// The strategy whose result was kept; `None` when no strategy produced one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<BuildStrategy>,
    #[serde(default)]
    pub artifacts: BuildArtifacts,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<BuildFailure>,
}

impl BuildResult {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }
}

fn default_context() -> PathBuf {
    PathBuf::from(".")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
