//! `devloop up` in the background, driven through the other subcommands.

use std::fs;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use assert_cmd::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

use devloop_engine::{EngineView, TargetPhase};

fn devloop_cmd(project: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("devloop"));
    cmd.arg("--project-dir").arg(project);
    cmd
}

/// Kills the engine if the test bails out early.
struct Engine(Child);

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn status(project: &Path) -> Option<EngineView> {
    let output = devloop_cmd(project)
        .args(["status", "--json"])
        .output()
        .ok()?;
    serde_json::from_slice(&output.stdout).ok()
}

fn wait_for(project: &Path, what: &str, done: impl Fn(&EngineView) -> bool) -> EngineView {
    let deadline = Instant::now() + Duration::from_secs(20);
    while Instant::now() < deadline {
        if let Some(view) = status(project) {
            if done(&view) {
                return view;
            }
        }
        sleep(Duration::from_millis(100));
    }
    panic!("timed out waiting for {what}");
}

fn built(view: &EngineView, name: &str, builds: usize) -> bool {
    view.target(name).is_some_and(|t| {
        t.phase == TargetPhase::Idle
            && t.history.iter().filter(|r| r.failure.is_none()).count() >= builds
    })
}

#[test]
fn up_builds_serves_status_and_stops() {
    let project = TempDir::new().expect("project");
    fs::create_dir_all(project.path().join("assets")).expect("assets dir");
    fs::write(
        project.path().join("devloop.yaml"),
        r#"
version: 1
settings:
  debounce_ms: 50
targets:
  - name: assets
    kind: local
    cmd: "echo built >> build.log"
    watch: [assets]
  - name: server
    kind: local
    cmd: "true"
    deps: [assets]
"#,
    )
    .expect("manifest");

    let mut engine = Engine(
        devloop_cmd(project.path())
            .arg("up")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn engine"),
    );

    let view = wait_for(project.path(), "initial builds", |v| {
        built(v, "assets", 1) && built(v, "server", 1)
    });
    let names: Vec<&str> = view.targets.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["assets", "server"]);
    assert!(project.path().join("build.log").exists());

    devloop_cmd(project.path())
        .arg("status")
        .assert()
        .success()
        .stdout(contains("assets"))
        .stdout(contains("idle"));

    // A source change rebuilds the target and then its dependent.
    fs::write(project.path().join("assets/app.css"), "body {}").expect("edit");
    wait_for(project.path(), "rebuild after edit", |v| {
        built(v, "assets", 2) && built(v, "server", 2)
    });

    devloop_cmd(project.path())
        .args(["trigger", "server"])
        .assert()
        .success()
        .stdout(contains("build of 'server' requested"));
    wait_for(project.path(), "triggered rebuild", |v| built(v, "server", 3));

    devloop_cmd(project.path())
        .args(["trigger", "nope"])
        .assert()
        .failure()
        .stderr(contains("unknown target 'nope'"));

    devloop_cmd(project.path())
        .arg("stop")
        .assert()
        .success()
        .stdout(contains("engine stop requested"));

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(exit) = engine.0.try_wait().expect("poll engine") {
            assert!(exit.success(), "engine exited with {exit}");
            break;
        }
        assert!(Instant::now() < deadline, "engine did not stop");
        sleep(Duration::from_millis(50));
    }
    assert!(!project.path().join(".devloop/devloop.sock").exists());
}
