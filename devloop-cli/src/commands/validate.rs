//! `devloop validate`: load a manifest without starting the engine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use devloop_core::{manifest, TargetDefinition, TriggerMode};

use super::resolve_manifest;

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Manifest to check, relative to the project dir.
    #[arg(long, short = 'f')]
    pub file: Option<PathBuf>,
}

#[derive(Tabled)]
struct OrderRow {
    #[tabled(rename = "#")]
    position: usize,
    #[tabled(rename = "target")]
    name: String,
    #[tabled(rename = "kind")]
    kind: String,
    #[tabled(rename = "deps")]
    deps: String,
    #[tabled(rename = "trigger")]
    trigger: String,
}

impl ValidateArgs {
    pub fn run(self, root: &Path) -> Result<()> {
        let path = resolve_manifest(root, self.file.as_deref());
        let loaded = manifest::load_at(&path)
            .with_context(|| format!("failed to load {}", path.display()))?;
        let validation = loaded
            .validate()
            .with_context(|| format!("{} is invalid", path.display()))?;

        let by_name: BTreeMap<_, &TargetDefinition> =
            loaded.targets.iter().map(|def| (def.name.clone(), def)).collect();
        let rows: Vec<OrderRow> = validation
            .order
            .iter()
            .filter_map(|name| by_name.get(name))
            .enumerate()
            .map(|(i, def)| OrderRow {
                position: i + 1,
                name: def.name.to_string(),
                kind: def.kind().to_string(),
                deps: if def.deps.is_empty() {
                    "-".to_string()
                } else {
                    def.deps
                        .iter()
                        .map(|d| d.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                },
                trigger: match def.trigger_mode {
                    TriggerMode::Auto => "auto".to_string(),
                    TriggerMode::Manual => "manual".to_string(),
                },
            })
            .collect();

        println!(
            "{} {} ({} targets)",
            "✓".green(),
            path.display(),
            rows.len()
        );
        if !rows.is_empty() {
            println!("{}", Table::new(rows).with(Style::rounded()));
        }
        for warning in &validation.warnings {
            println!("{} {}", "warning:".yellow(), warning);
        }
        Ok(())
    }
}
