// End-to-end tests for the `convoy` binary against a temporary database.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;

struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn db(&self) -> PathBuf {
        self.path().join("state/convoy.db")
    }

    fn convoy(&self) -> Command {
        let mut cmd = Command::cargo_bin("convoy").unwrap();
        cmd.current_dir(self.path())
            .env_remove("RUST_LOG")
            .arg("--db")
            .arg(self.db())
            .arg("--config")
            .arg(self.path().join("convoy.toml"));
        cmd
    }

    /// Import a small fleet: app → lib, plus an unrelated tool.
    fn import_fleet(&self) {
        let inventory = self.path().join("inventory.json");
        std::fs::write(
            &inventory,
            r#"[
                {"full_name": "acme/app", "complexity_score": 2,
                 "dependencies": [{"dependency_full_name": "acme/lib", "dependency_type": "submodule"}]},
                {"full_name": "acme/lib", "complexity_score": 1},
                {"full_name": "acme/tool", "complexity_score": 5, "is_fork": true}
            ]"#,
        )
        .unwrap();
        self.convoy()
            .args(["discovery", "import"])
            .arg(&inventory)
            .assert()
            .success()
            .stdout(predicate::str::contains("Recorded 3 repositories (0 errors)"));
    }
}

#[test]
fn status_on_fresh_database() {
    let ws = Workspace::new();
    ws.convoy()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Repositories: 0 total"))
        .stdout(predicate::str::contains("Discovery: never run"));
    assert!(ws.db().exists());
}

#[test]
fn import_then_plan_waves() {
    let ws = Workspace::new();
    ws.import_fleet();

    ws.convoy()
        .args(["plan", "waves", "--wave-size", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("wave 1: 2 repositories"))
        .stdout(predicate::str::contains("wave 2: 1 repositories"))
        .stdout(predicate::str::contains("acme/app (complexity 2)"));

    let output = ws
        .convoy()
        .args(["--json", "plan", "pilots", "--count", "1"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let pilots: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(pilots[0]["full_name"], "acme/lib");
    assert_eq!(pilots[0]["score"], 1);
}

#[test]
fn batch_lifecycle_and_exit_codes() {
    let ws = Workspace::new();
    ws.import_fleet();

    ws.convoy()
        .args(["batch", "create", "pilot", "--kind", "pilot"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created batch #1 'pilot'"));
    ws.convoy()
        .args(["batch", "create", "pilot"])
        .assert()
        .code(5);

    ws.convoy()
        .args(["repo", "set-status", "acme/lib", "dry_run_complete"])
        .assert()
        .success();
    ws.convoy()
        .args(["batch", "add", "1", "acme/lib"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Status:       ready"));
    ws.convoy()
        .args(["batch", "add", "1", "acme/app"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Status:       pending"));

    ws.convoy().args(["batch", "add", "9", "acme/tool"]).assert().code(3);
    ws.convoy().args(["batch", "add", "1", "acme/ghost"]).assert().code(3);

    ws.convoy()
        .args(["repo", "rollback", "acme/app", "--reason", "bad mirror"])
        .assert()
        .success()
        .stdout(predicate::str::contains("rollback #1"));
    ws.convoy()
        .args(["batch", "show", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Status:       ready"))
        .stdout(predicate::str::contains("acme/app").not());
    ws.convoy()
        .args(["repo", "history", "acme/app"])
        .assert()
        .success()
        .stdout(predicate::str::contains("rollback"))
        .stdout(predicate::str::contains("bad mirror"));
}

#[test]
fn discovery_status_reports_latest_run() {
    let ws = Workspace::new();
    ws.import_fleet();

    let output = ws
        .convoy()
        .args(["--json", "discovery", "status"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let run: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(run["status"], "completed");
    assert_eq!(run["processed_repos"], 3);

    ws.convoy()
        .args(["discovery", "reset"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No active discovery run"));
}

#[test]
fn invalid_config_exits_with_config_code() {
    let ws = Workspace::new();
    std::fs::write(ws.path().join("convoy.toml"), "[scheduling]\nwave_size = 0\n").unwrap();
    ws.convoy()
        .arg("status")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("wave_size"));
}

#[test]
fn unknown_status_tag_is_rejected_by_parser() {
    let ws = Workspace::new();
    ws.convoy()
        .args(["repo", "set-status", "acme/app", "teleported"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown RepositoryStatus 'teleported'"));
}
