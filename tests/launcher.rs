#![allow(missing_docs)]

// Launcher exit-code contract.

use assert_cmd::Command;

#[test]
fn check_config_accepts_valid_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("straylight.toml");
    std::fs::write(
        &path,
        r#"
[agent]
name = "tessier"

[approval]
timeout_ms = 1000
"#,
    )
    .expect("write config");

    Command::cargo_bin("straylight")
        .expect("binary exists")
        .args(["check-config", "--config"])
        .arg(&path)
        .assert()
        .success();
}

#[test]
fn check_config_rejects_bad_thresholds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("straylight.toml");
    std::fs::write(
        &path,
        r#"
[trust.thresholds]
high = 0.2
medium = 0.5
low = 0.25
quarantine = 0.1
"#,
    )
    .expect("write config");

    Command::cargo_bin("straylight")
        .expect("binary exists")
        .args(["check-config", "--config"])
        .arg(&path)
        .assert()
        .code(1);
}

#[test]
fn check_config_rejects_unparseable_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("straylight.toml");
    std::fs::write(&path, "this is not toml [").expect("write config");

    Command::cargo_bin("straylight")
        .expect("binary exists")
        .args(["check-config", "--config"])
        .arg(&path)
        .assert()
        .code(1);
}
