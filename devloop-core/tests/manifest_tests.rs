//! Manifest load error messages, atomic-write safety, and validation.

use assert_fs::prelude::*;
use devloop_core::{
    manifest::{self, MANIFEST_FILE},
    ConfigError, TargetKind, TargetName, UpdateMode,
};
use predicates::prelude::predicate;
use rstest::rstest;
use std::fs;
use std::path::PathBuf;

const TWO_TIER: &str = r#"
version: 1
settings:
  max_retries: 2
  update_mode: image
targets:
  - name: web-image
    kind: image
    image: localhost:5000/web
    watch: [web]
    live_update:
      sync:
        - local: web/src
          remote: /app/src
  - name: web
    kind: k8s
    manifests: [deploy/web.yaml]
    deps: [web-image]
    watch: [deploy]
"#;

// ---------------------------------------------------------------------------
// 1. Load error messages
// ---------------------------------------------------------------------------

#[test]
fn load_missing_manifest_returns_not_found() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let err = manifest::load_at(&manifest::manifest_path_at(root.path())).unwrap_err();
    assert!(matches!(err, ConfigError::NotFound { .. }), "got: {err}");
    assert!(err.to_string().contains("manifest not found"));
    assert!(err.to_string().contains(MANIFEST_FILE));
}

#[test]
fn load_corrupt_yaml_returns_parse_error_with_path() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let file = root.child(MANIFEST_FILE);
    file.write_str(": : corrupt : yaml : !!!\n  - broken: [unclosed")
        .expect("write");

    let err = manifest::load_at(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains(MANIFEST_FILE), "must contain file path, got: {err}");
}

#[test]
fn load_unknown_kind_returns_parse_error() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let file = root.child(MANIFEST_FILE);
    file.write_str("version: 1\ntargets:\n  - name: x\n    kind: helm\n")
        .expect("write");

    let err = manifest::load_at(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
}

// ---------------------------------------------------------------------------
// 2. Load + resolve
// ---------------------------------------------------------------------------

#[test]
fn load_resolves_paths_against_manifest_dir() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let file = root.child(MANIFEST_FILE);
    file.write_str(TWO_TIER).expect("write");

    let loaded = manifest::load_at(file.path()).expect("load");
    assert_eq!(loaded.settings.max_retries, 2);
    assert_eq!(loaded.settings.update_mode, UpdateMode::Image);
    assert_eq!(loaded.settings.history_limit, 10, "unset settings keep defaults");

    let image = &loaded.targets[0];
    assert_eq!(image.kind(), TargetKind::Image);
    assert_eq!(image.watch, vec![root.path().join("web")]);
    let live = image.live_update.as_ref().expect("live update");
    assert_eq!(live.sync[0].local, root.path().join("web/src"));
    assert_eq!(live.sync[0].remote, PathBuf::from("/app/src"));

    let validation = loaded.validate().expect("valid");
    assert_eq!(
        validation.order,
        vec![TargetName::from("web-image"), TargetName::from("web")]
    );
}

// ---------------------------------------------------------------------------
// 3. Atomic write safety
// ---------------------------------------------------------------------------

#[test]
fn save_cleans_up_tmp_file_and_roundtrips() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let path = manifest::manifest_path_at(root.path());
    let scaffold = manifest::scaffold("demo");
    manifest::save_at(&path, &scaffold).expect("save");

    root.child(MANIFEST_FILE).assert(predicate::path::exists());
    root.child("devloop.yaml.tmp")
        .assert(predicate::path::missing());

    let raw: manifest::Manifest =
        serde_yaml::from_str(&fs::read_to_string(&path).expect("read")).expect("parse");
    assert_eq!(raw, scaffold);
}

// ---------------------------------------------------------------------------
// 4. Validation
// ---------------------------------------------------------------------------

#[rstest]
#[case::cycle(
    "  - {name: a, kind: local, cmd: make, deps: [b]}\n  - {name: b, kind: local, cmd: make, deps: [a]}\n",
    "dependency cycle"
)]
#[case::unknown_dep(
    "  - {name: a, kind: local, cmd: make, deps: [ghost]}\n",
    "unknown target 'ghost'"
)]
#[case::duplicate(
    "  - {name: a, kind: local, cmd: make}\n  - {name: a, kind: local, cmd: make}\n",
    "declared more than once"
)]
#[case::no_manifests(
    "  - {name: a, kind: k8s, manifests: []}\n",
    "at least one manifest"
)]
#[case::empty_service(
    "  - {name: a, kind: compose, file: docker-compose.yml, service: ''}\n",
    "service must not be empty"
)]
fn invalid_target_lists_are_rejected(#[case] targets: &str, #[case] expected: &str) {
    let yaml = format!("version: 1\ntargets:\n{targets}");
    let parsed: manifest::Manifest = serde_yaml::from_str(&yaml).expect("parse");
    let err = parsed.validate().unwrap_err();
    assert!(err.to_string().contains(expected), "got: {err}");
}

#[test]
fn k8s_without_image_dependency_warns() {
    let yaml = "version: 1\ntargets:\n  - {name: db, kind: k8s, manifests: [db.yaml], watch: [db.yaml]}\n";
    let parsed: manifest::Manifest = serde_yaml::from_str(yaml).expect("parse");
    let validation = parsed.validate().expect("valid");
    assert_eq!(validation.warnings.len(), 1);
    assert!(validation.warnings[0].contains("no image target"));
}
