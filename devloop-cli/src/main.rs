//! devloop: keep declared workloads in sync with the source tree.
//!
//! # Usage
//!
//! ```text
//! devloop up [-f devloop.yaml] [--update-mode auto|image]
//! devloop status [--json]
//! devloop trigger <target>
//! devloop stop
//! devloop validate [-f devloop.yaml]
//! devloop init [--name <name>]
//! ```
//!
//! Every command works on the project in the current directory unless
//! `--project-dir` says otherwise.

mod commands;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use commands::{
    control::{StopArgs, TriggerArgs},
    init::InitArgs,
    status::StatusArgs,
    up::UpArgs,
    validate::ValidateArgs,
};
use devloop_core::UpdateMode;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "devloop",
    version,
    about = "Watch a source tree and keep images, Kubernetes objects, Compose services and local processes up to date",
    long_about = None,
)]
struct Cli {
    /// Project directory (where devloop.yaml lives).
    #[arg(long, short = 'C', global = true, default_value = ".")]
    project_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine in the foreground until stopped.
    Up(UpArgs),

    /// Show target status from the running engine.
    Status(StatusArgs),

    /// Ask the running engine to rebuild a target now.
    Trigger(TriggerArgs),

    /// Stop the running engine.
    Stop(StopArgs),

    /// Check a manifest and print the build order.
    Validate(ValidateArgs),

    /// Write a starter devloop.yaml.
    Init(InitArgs),
}

// ---------------------------------------------------------------------------
// Shared UpdateMode argument
// ---------------------------------------------------------------------------

/// Thin wrapper so clap can parse `UpdateMode` from CLI args.
#[derive(Debug, Clone, Copy)]
pub struct UpdateModeArg(pub UpdateMode);

impl FromStr for UpdateModeArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self(UpdateMode::Auto)),
            "image" => Ok(Self(UpdateMode::Image)),
            other => Err(format!(
                "unknown update mode '{other}'; expected: auto, image"
            )),
        }
    }
}

impl fmt::Display for UpdateModeArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<UpdateModeArg> for UpdateMode {
    fn from(mode: UpdateModeArg) -> Self {
        mode.0
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = cli
        .project_dir
        .canonicalize()
        .with_context(|| format!("cannot resolve project dir '{}'", cli.project_dir.display()))?;
    match cli.command {
        Commands::Up(args) => args.run(&root),
        Commands::Status(args) => args.run(&root),
        Commands::Trigger(args) => args.run(&root),
        Commands::Stop(args) => args.run(&root),
        Commands::Validate(args) => args.run(&root),
        Commands::Init(args) => args.run(&root),
    }
}
