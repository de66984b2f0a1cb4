//! Full image builds and Kubernetes deploys.
//!
//! Image targets are built and pushed. Kubernetes targets get the image
//! references of their dependencies substituted into their manifests, and
//! the result is applied to the cluster.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use devloop_core::{BuildArtifacts, BuildStrategy, ImageSpec, K8sSpec, TargetSpec};

use crate::capability::{ClusterClient, ImageBuilder};
use crate::digest::sha256_hex;
use crate::error::{io_err, BuildError};
use crate::strategy::{BuildAndDeployer, BuildRequest, StrategyOutcome};

pub struct ImageBuildAndDeployer {
    images: Arc<dyn ImageBuilder>,
    cluster: Arc<dyn ClusterClient>,
}

impl ImageBuildAndDeployer {
    pub fn new(images: Arc<dyn ImageBuilder>, cluster: Arc<dyn ClusterClient>) -> Self {
        Self { images, cluster }
    }

    async fn build_image(
        &self,
        spec: &ImageSpec,
        cancel: &CancellationToken,
    ) -> Result<BuildArtifacts, BuildError> {
        let tag = image_tag(Utc::now());
        let image_ref = self.images.build(spec, &tag, cancel).await?;
        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        self.images.push(&image_ref, cancel).await?;
        info!(image = %image_ref, "image built and pushed");
        Ok(BuildArtifacts {
            image_refs: vec![image_ref],
            deploy_digest: None,
        })
    }

    async fn deploy(
        &self,
        spec: &K8sSpec,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<(BuildArtifacts, Vec<String>), BuildError> {
        let mut docs = Vec::with_capacity(spec.manifests.len());
        for path in &spec.manifests {
            let doc = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| io_err(path, e))?;
            docs.push(doc.trim_end().to_string());
        }
        let yaml = format!("{}\n", docs.join("\n---\n"));

        let refs = request.dependency_images();
        let (yaml, unused) = inject_image_refs(&yaml, &refs);
        let warnings = unused
            .iter()
            .map(|r| format!("image {r} is not referenced by any manifest"))
            .collect();

        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        let objects = self.cluster.apply(&yaml, cancel).await?;
        debug!(target = %request.target.name, ?objects, "applied manifests");

        let used = refs.into_iter().filter(|r| !unused.contains(r)).collect();
        Ok((
            BuildArtifacts {
                image_refs: used,
                deploy_digest: Some(sha256_hex(yaml.as_bytes())),
            },
            warnings,
        ))
    }
}

#[async_trait]
impl BuildAndDeployer for ImageBuildAndDeployer {
    fn strategy(&self) -> BuildStrategy {
        BuildStrategy::ImageBuild
    }

    async fn build_and_deploy(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> StrategyOutcome {
        let result = match &request.target.spec {
            TargetSpec::Image(spec) => self
                .build_image(spec, cancel)
                .await
                .map(|artifacts| (artifacts, Vec::new())),
            TargetSpec::K8s(spec) => self.deploy(spec, request, cancel).await,
            _ => return StrategyOutcome::rejected("not an image or kubernetes target"),
        };
        match result {
            Ok((artifacts, warnings)) => StrategyOutcome::Success {
                artifacts,
                warnings,
            },
            Err(err) => StrategyOutcome::Fatal(err),
        }
    }
}

/// Tag for a freshly built image, unique per millisecond.
pub fn image_tag(now: DateTime<Utc>) -> String {
    format!("devloop-{}", now.format("%Y%m%d%H%M%S%3f"))
}

/// Repository part of an image reference: tag and digest stripped.
pub fn repository_of(reference: &str) -> &str {
    let without_digest = reference.split('@').next().unwrap_or(reference);
    match (without_digest.rfind(':'), without_digest.rfind('/')) {
        (Some(colon), Some(slash)) if colon > slash => &without_digest[..colon],
        (Some(colon), None) => &without_digest[..colon],
        _ => without_digest,
    }
}

/// Rewrite every `image:` field whose repository matches one of `refs`.
///
/// Returns the rewritten YAML and the refs no field matched.
pub fn inject_image_refs(yaml: &str, refs: &[String]) -> (String, Vec<String>) {
    let mut used = vec![false; refs.len()];
    let mut out: Vec<String> = Vec::new();
    for line in yaml.lines() {
        match rewrite_image_line(line, refs) {
            Some((rewritten, idx)) => {
                used[idx] = true;
                out.push(rewritten);
            }
            None => out.push(line.to_string()),
        }
    }
    let mut rewritten = out.join("\n");
    if yaml.ends_with('\n') {
        rewritten.push('\n');
    }
    let unused = refs
        .iter()
        .zip(used)
        .filter(|(_, used)| !used)
        .map(|(r, _)| r.clone())
        .collect();
    (rewritten, unused)
}

fn rewrite_image_line(line: &str, refs: &[String]) -> Option<(String, usize)> {
    let trimmed = line.trim_start();
    let field = trimmed.strip_prefix("- ").unwrap_or(trimmed);
    let value = field.strip_prefix("image:")?;
    let current = value.trim().trim_matches(|c| c == '"' || c == '\'');
    let repo = repository_of(current);
    let idx = refs.iter().position(|r| repository_of(r) == repo)?;
    let prefix = &line[..line.len() - value.len()];
    Some((format!("{prefix} {}", refs[idx]), idx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_strips_tag_not_port() {
        assert_eq!(repository_of("localhost:5000/web"), "localhost:5000/web");
        assert_eq!(repository_of("localhost:5000/web:devloop-1"), "localhost:5000/web");
        assert_eq!(repository_of("redis:7"), "redis");
        assert_eq!(repository_of("web@sha256:abc"), "web");
    }

    #[test]
    fn injects_matching_images_only() {
        let yaml = "spec:\n  containers:\n    - name: web\n      image: localhost:5000/web\n    - image: \"redis:7\"\n";
        let refs = vec![
            "localhost:5000/web:devloop-2".to_string(),
            "localhost:5000/worker:devloop-2".to_string(),
        ];
        let (out, unused) = inject_image_refs(yaml, &refs);
        assert!(out.contains("      image: localhost:5000/web:devloop-2\n"), "{out}");
        assert!(out.contains("- image: \"redis:7\""), "{out}");
        assert_eq!(unused, vec!["localhost:5000/worker:devloop-2".to_string()]);
    }

    #[test]
    fn tag_is_sortable_timestamp() {
        let a = image_tag(DateTime::from_timestamp(1_700_000_000, 0).expect("ts"));
        let b = image_tag(DateTime::from_timestamp(1_700_000_001, 0).expect("ts"));
        assert!(a < b);
        assert!(a.starts_with("devloop-2023"));
    }
}
