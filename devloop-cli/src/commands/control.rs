//! `devloop trigger` and `devloop stop`: requests to the running engine.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use devloop_engine::{request_stop, request_trigger, EngineError};

#[derive(Args, Debug)]
pub struct TriggerArgs {
    /// Target to rebuild.
    pub target: String,
}

impl TriggerArgs {
    pub fn run(self, root: &Path) -> Result<()> {
        match request_trigger(root, &self.target) {
            Ok(_) => {
                println!("{} build of '{}' requested", "✓".green(), self.target);
                Ok(())
            }
            Err(EngineError::EngineNotRunning { .. }) => {
                bail!("engine is not running; start it with `devloop up`")
            }
            Err(err) => Err(err).with_context(|| format!("failed to trigger '{}'", self.target)),
        }
    }
}

#[derive(Args, Debug)]
pub struct StopArgs {}

impl StopArgs {
    pub fn run(self, root: &Path) -> Result<()> {
        match request_stop(root) {
            Ok(()) => println!("engine stop requested"),
            Err(EngineError::EngineNotRunning { .. }) => println!("engine is not running"),
            Err(err) => return Err(err).context("failed to stop engine"),
        }
        Ok(())
    }
}
