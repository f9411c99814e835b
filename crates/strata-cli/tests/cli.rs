// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end checks of the `strata` binary against a demo project.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

fn write_demo_project(root: &Path) {
    let files: &[(&str, &str)] = &[
        ("project.yaml", "name: demo\n"),
        (
            "elements/base.bst",
            "kind: import\nsources:\n- kind: local\n  path: files/base\n",
        ),
        (
            "elements/app.bst",
            concat!(
                "kind: import\n",
                "build-depends:\n",
                "- base.bst\n",
                "sources:\n",
                "- kind: local\n",
                "  path: files/app\n",
            ),
        ),
        ("files/base/usr/lib/libbase.so", "base-bits"),
        ("files/app/usr/bin/app", "app-bits"),
    ];
    for (path, contents) in files {
        let full = root.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(full, contents).unwrap();
    }
}

fn strata(project: &Path, cache: &Path) -> Command {
    let mut cmd = Command::cargo_bin("strata").unwrap();
    cmd.arg("--project")
        .arg(project)
        .env("STRATA_CACHE_DIR", cache)
        .env_remove("STRATA_LOG_LEVEL");
    cmd
}

#[test]
fn build_then_rebuild_uses_the_cache() {
    let project = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    write_demo_project(project.path());

    strata(project.path(), cache.path())
        .args(["build", "app.bst"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 failed"));

    // Second invocation: everything is cached, nothing is processed.
    strata(project.path(), cache.path())
        .args(["build", "app.bst"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 processed"));
}

#[test]
fn show_reports_states_without_building() {
    let project = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    write_demo_project(project.path());

    strata(project.path(), cache.path())
        .args(["show", "app.bst"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("buildable")
                .and(predicate::str::contains("app.bst"))
                .and(predicate::str::contains("base.bst")),
        );

    strata(project.path(), cache.path())
        .args(["build", "app.bst"])
        .assert()
        .success();

    strata(project.path(), cache.path())
        .args(["show", "app.bst", "--format", "%{name}: %{state}"])
        .assert()
        .success()
        .stdout(predicate::str::contains("app.bst: cached"));
}

#[test]
fn artifact_checkout_restores_the_tree() {
    let project = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_demo_project(project.path());

    strata(project.path(), cache.path())
        .args(["build", "app.bst"])
        .assert()
        .success();

    let dest = out.path().join("checkout");
    strata(project.path(), cache.path())
        .args(["artifact", "checkout", "app.bst"])
        .arg(&dest)
        .assert()
        .success();
    assert_eq!(
        std::fs::read_to_string(dest.join("usr/bin/app")).unwrap(),
        "app-bits"
    );
}

#[test]
fn failed_load_exits_fatally() {
    let project = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    std::fs::write(project.path().join("project.yaml"), "name: demo\n").unwrap();

    strata(project.path(), cache.path())
        .args(["build", "ghost.bst"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("MISSING_FILE"));
}

#[test]
fn source_checkout_stages_sources() {
    let project = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_demo_project(project.path());

    let dest = out.path().join("sources");
    strata(project.path(), cache.path())
        .args(["source", "checkout", "app.bst"])
        .arg(&dest)
        .assert()
        .success();
    assert_eq!(
        std::fs::read_to_string(dest.join("usr/bin/app")).unwrap(),
        "app-bits"
    );
}

#[test]
fn workspace_open_and_close_roundtrip() {
    let project = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_demo_project(project.path());

    let workspace = out.path().join("workspace");
    strata(project.path(), cache.path())
        .args(["workspace", "open", "app.bst"])
        .arg(&workspace)
        .assert()
        .success();
    assert!(workspace.join("usr/bin/app").is_file());

    strata(project.path(), cache.path())
        .args(["workspace", "close", "app.bst"])
        .assert()
        .success()
        .stdout(predicate::str::contains("closed workspace"));
}
