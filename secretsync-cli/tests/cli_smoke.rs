use assert_cmd::Command;
use std::fs;
use tempfile::TempDir;

fn write_config(tmp: &TempDir, contents: &str) -> String {
    let path = tmp.path().join("config.yaml");
    fs::write(&path, contents).expect("write config");
    path.to_str().expect("utf-8 path").to_string()
}

fn cli_cmd() -> Command {
    let mut cmd = Command::cargo_bin("secretsync").expect("binary built");
    cmd.env_remove("SECRETSYNC_CONFIG")
        .env_remove("SECRETSYNC_TARGETS")
        .env_remove("VAULT_ADDR");
    cmd
}

#[test]
fn help_works() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Synchronize secrets"));
}

#[test]
fn version_prints_without_a_config() {
    cli_cmd()
        .arg("version")
        .assert()
        .success()
        .stdout(predicates::str::contains("secretsync"));
}

#[test]
fn validate_accepts_a_minimal_config() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(
        &tmp,
        r#"
sources:
  base:
    vault:
      mount: app-secrets
targets:
  Production:
    account_id: "123456789012"
    imports: [base]
"#,
    );

    cli_cmd()
        .args(["--config", &config, "validate"])
        .assert()
        .success()
        .stdout(predicates::str::contains("Configuration OK"));
}

#[test]
fn validate_rejects_an_inheritance_cycle() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(
        &tmp,
        r#"
targets:
  A:
    account_id: "111111111111"
    imports: [B]
  B:
    account_id: "222222222222"
    imports: [A]
"#,
    );

    cli_cmd()
        .args(["--config", &config, "validate"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("circular dependency"));
}

#[test]
fn graph_prints_the_processing_order() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(
        &tmp,
        r#"
targets:
  Prod:
    account_id: "111111111111"
    imports: [Stg]
  Stg:
    account_id: "222222222222"
    imports: [base]
"#,
    );

    let output = cli_cmd()
        .args(["--config", &config, "graph"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&output);
    let stg = text.find("Stg [leaf]").expect("Stg listed");
    let prod = text.find("Prod [inherited]").expect("Prod listed");
    assert!(stg < prod, "imports should precede importers:\n{text}");
}

#[test]
fn missing_config_file_fails() {
    cli_cmd()
        .args(["--config", "/nonexistent/config.yaml", "validate"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("failed to load config"));
}
