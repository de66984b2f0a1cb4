//! Error types for devloop-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from loading or validating configuration.
///
/// A configuration error never stops a running engine: the reload is
/// rejected wholesale and the last good configuration stays in effect.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (write/save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load. Includes file path and line context from serde_yaml.
    #[error("failed to parse manifest at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The manifest file did not exist at the expected path.
    #[error("manifest not found at {path}")]
    NotFound { path: PathBuf },

    #[error("unsupported manifest version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("target '{name}' is declared more than once")]
    DuplicateTarget { name: String },

    #[error("target '{target}' depends on unknown target '{dependency}'")]
    UnknownDependency { target: String, dependency: String },

    /// The dependency graph is not acyclic; `target` lies on the cycle.
    #[error("dependency cycle detected involving target '{target}'")]
    DependencyCycle { target: String },

    #[error("invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}
