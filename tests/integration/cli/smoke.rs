use std::fs;
use std::path::Path;

use predicates::prelude::*;

fn qcollab(config_dir: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("qcollab");
    cmd.env("QCOLLAB_CONFIG_DIR", config_dir)
        .env("QCOLLAB_LOG_DIR", config_dir.join("logs"))
        .env_remove("QCOLLAB_LOG")
        .env_remove("QCOLLAB_LISTEN_ADDR")
        .env_remove("QCOLLAB_PEERS");
    cmd
}

#[test]
fn config_show_renders_file_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("node.toml");
    fs::write(
        &path,
        "[collab]\nlisten_addr = \"127.0.0.1:9911\"\nserver_name = \"smoke\"\n",
    )
    .unwrap();

    qcollab(dir.path())
        .args(["config", "show", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("listen_addr = \"127.0.0.1:9911\""))
        .stdout(predicate::str::contains("server_name = \"smoke\""));
}

#[test]
fn config_path_uses_config_dir() {
    let dir = tempfile::tempdir().unwrap();
    qcollab(dir.path())
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"))
        .stdout(predicate::str::contains(dir.path().to_string_lossy().as_ref()));
}

#[test]
fn config_init_writes_defaults_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fresh.toml");

    qcollab(dir.path())
        .args(["config", "init", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("wrote"));
    let written = fs::read_to_string(&path).unwrap();
    assert!(written.contains("check_interval_ms = 1000"));

    qcollab(dir.path())
        .args(["config", "init", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("already exists"));
}

#[test]
fn run_rejects_too_short_check_interval() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    fs::write(
        &path,
        "[collab]\nlisten_addr = \"127.0.0.1:0\"\ncheck_interval_ms = 50\n",
    )
    .unwrap();

    qcollab(dir.path())
        .args(["run", "--no-startup-sync", "--config"])
        .arg(&path)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("collab.check_interval_ms"));
}

#[test]
fn unparsable_config_exits_before_running() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[collab\n").unwrap();

    qcollab(dir.path())
        .args(["run", "--config"])
        .arg(&path)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("failed to parse"));
}
