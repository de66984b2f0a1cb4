//! `devloop up`: run the engine in the foreground.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use devloop_engine::{start_blocking, EngineOptions};

use super::resolve_manifest;
use crate::UpdateModeArg;

#[derive(Args, Debug)]
pub struct UpArgs {
    /// Manifest to load, relative to the project dir.
    #[arg(long, short = 'f')]
    pub file: Option<PathBuf>,

    /// auto: update containers in place when possible. image: always rebuild.
    #[arg(long, value_name = "MODE")]
    pub update_mode: Option<UpdateModeArg>,
}

impl UpArgs {
    pub fn run(self, root: &Path) -> Result<()> {
        let options = EngineOptions {
            project_root: root.to_path_buf(),
            manifest_path: Some(resolve_manifest(root, self.file.as_deref())),
            update_mode: self.update_mode.map(Into::into),
        };
        start_blocking(options).context("engine exited with error")
    }
}
