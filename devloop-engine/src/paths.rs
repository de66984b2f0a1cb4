use std::path::{Path, PathBuf};

pub const RUNTIME_DIR: &str = ".devloop";
pub const ENGINE_SOCKET: &str = "devloop.sock";

/// `<root>/.devloop`; holds the control socket while the engine runs.
pub fn runtime_dir(root: &Path) -> PathBuf {
    root.join(RUNTIME_DIR)
}

pub fn socket_path(root: &Path) -> PathBuf {
    runtime_dir(root).join(ENGINE_SOCKET)
}

/// Whether `path` lies inside the runtime directory of `root`. Events there
/// are the engine's own and never mark targets stale.
pub fn is_runtime_path(root: &Path, path: &Path) -> bool {
    path.starts_with(runtime_dir(root))
}
