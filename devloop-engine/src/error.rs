use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the engine runtime, its watcher and the control socket.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("configuration error: {0}")]
    Config(#[from] devloop_core::ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("engine protocol error: {0}")]
    Protocol(String),

    #[error("engine is not running (socket missing: {socket})")]
    EngineNotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> EngineError {
    EngineError::Io {
        path: path.into(),
        source,
    }
}
