use assert_cmd::Command;
use predicates::prelude::*;

fn constel() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("constel").unwrap()
}

#[test]
fn test_help_exits_successfully() {
    constel().arg("--help").assert().success();
}

#[test]
fn test_version_exits_successfully() {
    constel()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("constel"));
}

#[test]
fn test_no_args_shows_usage() {
    constel()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_unknown_subcommand_fails() {
    constel()
        .arg("nonexistent")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_help_lists_all_subcommands() {
    let assert = constel().arg("--help").assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();

    for cmd in [
        "coordinator",
        "access-manager",
        "etcd-ioprio",
        "parse-service-account",
    ] {
        assert!(
            output.contains(cmd),
            "Help output should list '{}' subcommand",
            cmd
        );
    }
}

#[test]
fn test_coordinator_requires_config() {
    constel()
        .arg("coordinator")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--config"));
}

#[test]
fn test_coordinator_rejects_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coordinator.toml");
    std::fs::write(&path, "[node]\napi_port = 51820\n").unwrap();
    constel()
        .args(["coordinator", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("must differ"));
}

#[test]
fn test_access_manager_requires_key_source() {
    constel()
        .arg("access-manager")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--keys"));
}

#[test]
fn test_parse_service_account_redacts_secret() {
    constel()
        .args([
            "parse-service-account",
            "serviceaccount://azure?tenant_id=tenant&client_id=client&client_secret=hunter2&location=westeurope",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("tenant"))
        .stdout(predicate::str::contains("<redacted>"))
        .stdout(predicate::str::contains("hunter2").not());
}

#[test]
fn test_parse_service_account_rejects_bad_uri() {
    constel()
        .args(["parse-service-account", "https://example.com"])
        .assert()
        .failure();
}
