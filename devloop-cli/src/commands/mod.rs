pub mod control;
pub mod init;
pub mod status;
pub mod up;
pub mod validate;

use std::path::{Path, PathBuf};

use devloop_core::manifest::manifest_path_at;

/// `-f` relative to the project dir, or `<root>/devloop.yaml`.
pub fn resolve_manifest(root: &Path, file: Option<&Path>) -> PathBuf {
    match file {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => root.join(path),
        None => manifest_path_at(root),
    }
}
