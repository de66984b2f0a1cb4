//! `devloop init`: write a starter manifest.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use devloop_core::manifest::{manifest_path_at, save_at, scaffold};

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Base name for the generated targets. Defaults to the directory name.
    #[arg(long)]
    pub name: Option<String>,
}

impl InitArgs {
    pub fn run(self, root: &Path) -> Result<()> {
        let path = manifest_path_at(root);
        if path.exists() {
            bail!("{} already exists", path.display());
        }
        let name = match self.name {
            Some(name) => name,
            None => root
                .file_name()
                .and_then(|n| n.to_str())
                .map(sanitize)
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "app".to_string()),
        };

        save_at(&path, &scaffold(&name))
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("{} wrote {}", "✓".green(), path.display());
        println!("  edit the targets, then run `devloop up`");
        Ok(())
    }
}

/// Lowercase alphanumerics and dashes, as target names expect.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}
