//! Capability implementations backed by the `docker`, `kubectl` and `sh`
//! command-line tools.
//!
//! Every process is spawned with `kill_on_drop`, so cancelling the token or
//! hitting the timeout tears the child down with the future.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use devloop_core::{
    BuildArtifacts, ComposeSpec, ImageSpec, LocalSpec, ResourceKind, ResourceObservation,
    ResourceStatus, TargetDefinition, TargetSpec,
};

use crate::capability::{
    Capabilities, ClusterClient, CommandRunner, ComposeClient, ContainerUpdater, FileCopy,
    ImageBuilder, ResourceProbe,
};
use crate::error::BuildError;
use crate::strategy::BuildRequest;

const BUILD_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const DEPLOY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// stderr fragments that indicate a retryable infrastructure problem.
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "tls handshake",
    "temporary failure",
    "too many requests",
    "service unavailable",
    "unexpected eof",
    "no route to host",
];

/// All capabilities, implemented with the local CLI tools and running
/// from `project_root`.
pub fn cli_capabilities(project_root: &Path) -> Capabilities {
    let root = project_root.to_path_buf();
    Capabilities {
        images: Arc::new(DockerCli { root: root.clone() }),
        cluster: Arc::new(KubectlCli { root: root.clone() }),
        compose: Arc::new(ComposeCli { root: root.clone() }),
        updater: Arc::new(CliUpdater { root: root.clone() }),
        commands: Arc::new(ShellRunner { root: root.clone() }),
        probe: Arc::new(CliProbe { root }),
    }
}

// ---------------------------------------------------------------------------
// 1. Process execution
// ---------------------------------------------------------------------------

/// One external command invocation.
pub struct Invocation<'a> {
    pub program: &'a str,
    pub args: Vec<String>,
    pub cwd: &'a Path,
    pub env: BTreeMap<String, String>,
    pub stdin: Option<String>,
    pub timeout: Duration,
}

impl<'a> Invocation<'a> {
    pub fn new(program: &'a str, cwd: &'a Path, timeout: Duration) -> Self {
        Self {
            program,
            args: Vec::new(),
            cwd,
            env: BTreeMap::new(),
            stdin: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Run to completion; returns trimmed stdout.
    pub async fn run(self, cancel: &CancellationToken) -> Result<String, BuildError> {
        let mut command = Command::new(self.program);
        command
            .args(&self.args)
            .current_dir(self.cwd)
            .envs(&self.env)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = self.program, args = ?self.args, "spawning process");
        let mut child = command.spawn().map_err(|source| BuildError::Spawn {
            program: self.program.to_string(),
            source,
        })?;

        if let (Some(input), Some(mut pipe)) = (self.stdin, child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(err) = pipe.write_all(input.as_bytes()).await {
                    debug!(error = %err, "stdin closed early");
                }
            });
        }

        let output = tokio::select! {
            waited = tokio::time::timeout(self.timeout, child.wait_with_output()) => match waited {
                Ok(Ok(output)) => output,
                Ok(Err(source)) => {
                    return Err(BuildError::Spawn {
                        program: self.program.to_string(),
                        source,
                    })
                }
                Err(_) => {
                    return Err(BuildError::Timeout {
                        program: self.program.to_string(),
                        secs: self.timeout.as_secs(),
                    })
                }
            },
            _ = cancel.cancelled() => return Err(BuildError::Cancelled),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(BuildError::Command {
                program: self.program.to_string(),
                status: output.status.to_string(),
                transient: looks_transient(&stderr),
                stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Whether a failed command's stderr points at a retryable condition.
pub fn looks_transient(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}

// ---------------------------------------------------------------------------
// 2. docker
// ---------------------------------------------------------------------------

pub struct DockerCli {
    root: PathBuf,
}

#[async_trait]
impl ImageBuilder for DockerCli {
    async fn build(
        &self,
        spec: &ImageSpec,
        tag: &str,
        cancel: &CancellationToken,
    ) -> Result<String, BuildError> {
        let image_ref = format!("{}:{tag}", spec.image);
        let mut invocation = Invocation::new("docker", &self.root, BUILD_TIMEOUT)
            .args(["build", "-t", image_ref.as_str()]);
        if let Some(dockerfile) = &spec.dockerfile {
            invocation = invocation.arg("-f").arg(dockerfile.to_string_lossy());
        }
        for (key, value) in &spec.build_args {
            invocation = invocation.arg("--build-arg").arg(format!("{key}={value}"));
        }
        invocation
            .arg(spec.context.to_string_lossy())
            .run(cancel)
            .await?;
        Ok(image_ref)
    }

    async fn push(&self, image_ref: &str, cancel: &CancellationToken) -> Result<(), BuildError> {
        Invocation::new("docker", &self.root, BUILD_TIMEOUT)
            .args(["push", image_ref])
            .run(cancel)
            .await?;
        Ok(())
    }
}

pub struct ComposeCli {
    root: PathBuf,
}

#[async_trait]
impl ComposeClient for ComposeCli {
    async fn up(
        &self,
        spec: &ComposeSpec,
        build: bool,
        cancel: &CancellationToken,
    ) -> Result<(), BuildError> {
        let mut invocation = compose(&self.root, spec, BUILD_TIMEOUT).args(["up", "-d"]);
        if build {
            invocation = invocation.arg("--build");
        }
        invocation.arg(spec.service.as_str()).run(cancel).await?;
        Ok(())
    }
}

fn compose<'a>(root: &'a Path, spec: &ComposeSpec, timeout: Duration) -> Invocation<'a> {
    Invocation::new("docker", root, timeout).args([
        "compose".to_string(),
        "-f".to_string(),
        spec.file.to_string_lossy().into_owned(),
    ])
}

// ---------------------------------------------------------------------------
// 3. kubectl
// ---------------------------------------------------------------------------

pub struct KubectlCli {
    root: PathBuf,
}

#[async_trait]
impl ClusterClient for KubectlCli {
    async fn apply(
        &self,
        yaml: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, BuildError> {
        let stdout = Invocation::new("kubectl", &self.root, DEPLOY_TIMEOUT)
            .args(["apply", "-f", "-", "-o", "name"])
            .stdin(yaml)
            .run(cancel)
            .await?;
        Ok(stdout.lines().map(str::to_string).collect())
    }
}

/// One row of `kubectl get pods`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PodRow {
    name: String,
    phase: String,
    images: Vec<String>,
}

const POD_COLUMNS: &str = "jsonpath={range .items[*]}{.metadata.name}{\"\\t\"}{.status.phase}{\"\\t\"}{.spec.containers[*].image}{\"\\n\"}{end}";

async fn list_pods(root: &Path, cancel: &CancellationToken) -> Result<Vec<PodRow>, BuildError> {
    let stdout = Invocation::new("kubectl", root, QUERY_TIMEOUT)
        .args(["get", "pods", "-o", POD_COLUMNS])
        .run(cancel)
        .await?;
    Ok(parse_pod_rows(&stdout))
}

fn parse_pod_rows(stdout: &str) -> Vec<PodRow> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let name = fields.next()?.trim();
            if name.is_empty() {
                return None;
            }
            let phase = fields.next().unwrap_or("").trim().to_string();
            let images = fields
                .next()
                .unwrap_or("")
                .split_whitespace()
                .map(str::to_string)
                .collect();
            Some(PodRow {
                name: name.to_string(),
                phase,
                images,
            })
        })
        .collect()
}

fn pods_running(pods: Vec<PodRow>, image_refs: &[String]) -> Vec<PodRow> {
    pods.into_iter()
        .filter(|pod| pod.images.iter().any(|image| image_refs.contains(image)))
        .collect()
}

fn pod_status(phase: &str) -> ResourceStatus {
    match phase {
        "Running" => ResourceStatus::Running,
        "Succeeded" => ResourceStatus::Succeeded,
        "Failed" => ResourceStatus::Failed,
        _ => ResourceStatus::Pending,
    }
}

// ---------------------------------------------------------------------------
// 4. In-place updates
// ---------------------------------------------------------------------------

pub struct CliUpdater {
    root: PathBuf,
}

impl CliUpdater {
    async fn copy_and_run(
        &self,
        program: &str,
        exec_args: &[String],
        copy: impl Fn(&FileCopy) -> Vec<String>,
        remove: impl Fn(&FileCopy) -> Vec<String>,
        copies: &[FileCopy],
        run: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), BuildError> {
        for file in copies {
            let args = if file.local.exists() {
                copy(file)
            } else {
                remove(file)
            };
            Invocation::new(program, &self.root, DEPLOY_TIMEOUT)
                .args(args)
                .run(cancel)
                .await?;
        }
        for command in run {
            let result = Invocation::new(program, &self.root, BUILD_TIMEOUT)
                .args(exec_args.iter().cloned())
                .args(["sh", "-c", command.as_str()])
                .run(cancel)
                .await;
            match result {
                Ok(_) => {}
                Err(BuildError::Command { stderr, status, .. }) => {
                    return Err(BuildError::RunStep {
                        command: command.clone(),
                        message: format!("{status}: {stderr}"),
                    })
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerUpdater for CliUpdater {
    fn supports_live_update(&self) -> bool {
        true
    }

    async fn update(
        &self,
        request: &BuildRequest,
        copies: &[FileCopy],
        run: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), BuildError> {
        let prior_refs = request
            .prior
            .as_ref()
            .map(|prior| prior.artifacts.image_refs.clone())
            .unwrap_or_default();

        match &request.target.spec {
            TargetSpec::Compose(spec) => {
                let ids = compose(&self.root, spec, QUERY_TIMEOUT)
                    .args(["ps", "-q", spec.service.as_str()])
                    .run(cancel)
                    .await?;
                let ids: Vec<&str> = ids.lines().filter(|l| !l.is_empty()).collect();
                if ids.is_empty() {
                    return Err(BuildError::Transient(format!(
                        "no running container for service {}",
                        spec.service
                    )));
                }
                for id in ids {
                    let exec_args = vec!["exec".to_string(), id.to_string()];
                    self.copy_and_run(
                        "docker",
                        &exec_args,
                        |f| {
                            vec![
                                "cp".into(),
                                f.local.to_string_lossy().into_owned(),
                                format!("{id}:{}", f.remote.display()),
                            ]
                        },
                        |f| {
                            vec![
                                "exec".into(),
                                id.to_string(),
                                "rm".into(),
                                "-rf".into(),
                                f.remote.to_string_lossy().into_owned(),
                            ]
                        },
                        copies,
                        run,
                        cancel,
                    )
                    .await?;
                }
            }
            TargetSpec::Image(_) | TargetSpec::K8s(_) => {
                let pods = pods_running(list_pods(&self.root, cancel).await?, &prior_refs);
                if pods.is_empty() {
                    return Err(BuildError::Transient(
                        "no running pod uses the deployed image".into(),
                    ));
                }
                for pod in pods {
                    let name = pod.name;
                    let exec_args = vec!["exec".to_string(), name.clone(), "--".to_string()];
                    self.copy_and_run(
                        "kubectl",
                        &exec_args,
                        |f| {
                            vec![
                                "cp".into(),
                                f.local.to_string_lossy().into_owned(),
                                format!("{name}:{}", f.remote.display()),
                            ]
                        },
                        |f| {
                            vec![
                                "exec".into(),
                                name.clone(),
                                "--".into(),
                                "rm".into(),
                                "-rf".into(),
                                f.remote.to_string_lossy().into_owned(),
                            ]
                        },
                        copies,
                        run,
                        cancel,
                    )
                    .await?;
                }
            }
            TargetSpec::Local(_) => {
                return Err(BuildError::Fatal("local targets have no containers".into()))
            }
        }
        info!(target = %request.target.name, files = copies.len(), "live update applied");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 5. Local commands
// ---------------------------------------------------------------------------

pub struct ShellRunner {
    root: PathBuf,
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, spec: &LocalSpec, cancel: &CancellationToken) -> Result<String, BuildError> {
        let cwd = spec.workdir.as_deref().unwrap_or(&self.root);
        let mut invocation =
            Invocation::new("sh", cwd, BUILD_TIMEOUT).args(["-c", spec.cmd.as_str()]);
        invocation.env = spec.env.clone();
        invocation.run(cancel).await
    }
}

// ---------------------------------------------------------------------------
// 6. Resource probe
// ---------------------------------------------------------------------------

pub struct CliProbe {
    root: PathBuf,
}

#[async_trait]
impl ResourceProbe for CliProbe {
    async fn observe(
        &self,
        target: &TargetDefinition,
        deployed: &BuildArtifacts,
    ) -> Result<Vec<ResourceObservation>, BuildError> {
        let cancel = CancellationToken::new();
        match &target.spec {
            TargetSpec::Image(_) | TargetSpec::K8s(_) => {
                if deployed.image_refs.is_empty() {
                    return Ok(Vec::new());
                }
                let pods = pods_running(list_pods(&self.root, &cancel).await?, &deployed.image_refs);
                Ok(pods
                    .into_iter()
                    .map(|pod| ResourceObservation {
                        kind: ResourceKind::Pod,
                        status: pod_status(&pod.phase),
                        name: pod.name,
                    })
                    .collect())
            }
            TargetSpec::Compose(spec) => {
                let stdout = compose(&self.root, spec, QUERY_TIMEOUT)
                    .args(["ps", "-a", "--format", "{{.Name}}\t{{.State}}"])
                    .arg(spec.service.as_str())
                    .run(&cancel)
                    .await?;
                let mut observed = parse_compose_rows(&stdout);
                if observed.is_empty() {
                    observed.push(ResourceObservation {
                        kind: ResourceKind::Container,
                        name: spec.service.clone(),
                        status: ResourceStatus::Gone,
                    });
                }
                Ok(observed)
            }
            TargetSpec::Local(_) => Ok(Vec::new()),
        }
    }
}

fn parse_compose_rows(stdout: &str) -> Vec<ResourceObservation> {
    stdout
        .lines()
        .filter_map(|line| {
            let (name, state) = line.split_once('\t')?;
            let status = match state.trim() {
                "running" => ResourceStatus::Running,
                "created" | "restarting" => ResourceStatus::Pending,
                "exited" | "dead" => ResourceStatus::Failed,
                _ => ResourceStatus::Pending,
            };
            Some(ResourceObservation {
                kind: ResourceKind::Container,
                name: name.trim().to_string(),
                status,
            })
        })
        .collect()
}
