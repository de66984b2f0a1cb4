//! Error types for devloop-build.

use std::path::PathBuf;

use thiserror::Error;

use devloop_core::FailureKind;

/// All errors that can arise while building or deploying a target.
#[derive(Debug, Error)]
pub enum BuildError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The external program could not be started at all.
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The external program ran and exited unsuccessfully.
    #[error("`{program}` exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
        transient: bool,
    },

    #[error("`{program}` timed out after {secs}s")]
    Timeout { program: String, secs: u64 },

    /// A command run inside the container after syncing files failed.
    #[error("live update step `{command}` failed: {message}")]
    RunStep { command: String, message: String },

    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),

    #[error("build cancelled")]
    Cancelled,
}

impl BuildError {
    /// How the engine treats a build that ended with this error.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            BuildError::Cancelled => FailureKind::Cancelled,
            BuildError::Timeout { .. } | BuildError::Transient(_) => FailureKind::Transient,
            BuildError::Command { transient, .. } if *transient => FailureKind::Transient,
            _ => FailureKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.failure_kind() == FailureKind::Transient
    }
}

/// Convenience constructor for [`BuildError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> BuildError {
    BuildError::Io {
        path: path.into(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(BuildError::Timeout {
            program: "docker".into(),
            secs: 600
        }
        .is_transient());
        assert!(BuildError::Command {
            program: "kubectl".into(),
            status: "exit status: 1".into(),
            stderr: "connection refused".into(),
            transient: true,
        }
        .is_transient());
        assert_eq!(
            BuildError::RunStep {
                command: "make".into(),
                message: "exit 2".into()
            }
            .failure_kind(),
            FailureKind::Fatal
        );
        assert_eq!(BuildError::Cancelled.failure_kind(), FailureKind::Cancelled);
    }
}
