//! `devloop status`: what the running engine is doing.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::{ColoredString, Colorize};
use serde_json::json;
use tabled::{settings::Style, Table, Tabled};

use devloop_engine::{
    paths::socket_path, request_status, EngineError, EngineView, TargetPhase, TargetView,
};

/// Arguments for `devloop status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit the raw engine view as JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self, root: &Path) -> Result<()> {
        let view = match request_status(root) {
            Ok(view) => view,
            Err(EngineError::EngineNotRunning { .. }) => {
                if self.json {
                    let body = json!({
                        "running": false,
                        "socket": socket_path(root).display().to_string(),
                    });
                    println!("{}", serde_json::to_string_pretty(&body)?);
                } else {
                    println!("engine is not running");
                }
                return Ok(());
            }
            Err(err) => return Err(err).context("failed to query engine status"),
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&view).context("failed to serialize status")?
            );
            return Ok(());
        }
        print_view(&view, Utc::now());
        Ok(())
    }
}

#[derive(Tabled)]
struct TargetRow {
    #[tabled(rename = "target")]
    name: String,
    #[tabled(rename = "kind")]
    kind: String,
    #[tabled(rename = "phase")]
    phase: String,
    #[tabled(rename = "last build")]
    last_build: String,
    #[tabled(rename = "detail")]
    detail: String,
}

fn print_view(view: &EngineView, now: DateTime<Utc>) {
    if let Some(err) = &view.config_error {
        println!("{} {}", "config error:".red().bold(), err);
    }
    for warning in &view.config_warnings {
        println!("{} {}", "warning:".yellow(), warning);
    }

    if view.targets.is_empty() {
        println!("no targets loaded");
    } else {
        let rows: Vec<TargetRow> = view.targets.iter().map(|t| row(t, now)).collect();
        println!("{}", Table::new(rows).with(Style::rounded()));
    }

    if let Some(build) = &view.current_build {
        println!(
            "building {} ({}) for {}",
            build.target.as_str().bold(),
            build.reason,
            format_age(build.started_at, now)
        );
    }
    println!(
        "{} builds, {} failed",
        view.counters.builds_completed, view.counters.builds_failed
    );
}

fn row(target: &TargetView, now: DateTime<Utc>) -> TargetRow {
    let last_build = match &target.last_result {
        Some(result) => format!(
            "{} ago ({}ms)",
            format_age(result.finished_at, now),
            result.duration_ms
        ),
        None => "never".to_string(),
    };
    TargetRow {
        name: target.name.to_string(),
        kind: target.kind.to_string(),
        phase: colored_phase(target.phase).to_string(),
        last_build,
        detail: detail(target, now),
    }
}

fn detail(target: &TargetView, now: DateTime<Utc>) -> String {
    if let Some(blocked) = &target.blocked {
        return format!("{}: {}", blocked.reason, blocked.message);
    }
    if let Some(failure) = target.last_result.as_ref().and_then(|r| r.failure.as_ref()) {
        let mut text = format!("{}: {}", failure.kind, failure.message);
        if let Some(retry_at) = target.retry_at {
            if retry_at > now {
                text.push_str(&format!(" (retry in {})", format_age(now, retry_at)));
            }
        }
        return text;
    }
    if !target.pending_files.is_empty() {
        return format!("{} changed file(s)", target.pending_files.len());
    }
    let unhealthy = target
        .resources
        .iter()
        .filter(|r| !r.status.is_healthy())
        .map(|r| format!("{} {} {}", r.kind, r.name, r.status))
        .collect::<Vec<_>>();
    unhealthy.join(", ")
}

fn colored_phase(phase: TargetPhase) -> ColoredString {
    let text = phase.to_string();
    match phase {
        TargetPhase::Idle => text.green(),
        TargetPhase::Pending => text.yellow(),
        TargetPhase::Building => text.cyan(),
        TargetPhase::Error => text.red(),
        TargetPhase::Blocked => text.red().bold(),
    }
}

fn format_age(since: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - since).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m", secs / 60),
        _ => format!("{}h", secs / 3600),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn age_is_coarse_and_never_negative() {
        let now = Utc::now();
        assert_eq!(format_age(now - TimeDelta::seconds(12), now), "12s");
        assert_eq!(format_age(now - TimeDelta::seconds(150), now), "2m");
        assert_eq!(format_age(now - TimeDelta::hours(3), now), "3h");
        assert_eq!(format_age(now + TimeDelta::seconds(5), now), "0s");
    }
}
