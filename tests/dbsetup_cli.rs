//! Command-line tests for the `dbsetup` binary

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn write_config(dir: &Path, migrations: &[(&str, &str)]) -> std::path::PathBuf {
    let core = dir.join("core");
    fs::create_dir_all(&core).unwrap();
    for (file, sql) in migrations {
        fs::write(core.join(file), sql).unwrap();
    }
    let config = dir.join("setup.toml");
    fs::write(
        &config,
        format!(
            "[database]\nuri = \"sqlite:///{}\"\n\n[[modules]]\nid = \"com.example.core\"\npath = \"core\"\n",
            dir.join("app.db").display()
        ),
    )
    .unwrap();
    config
}

fn dbsetup() -> Command {
    Command::cargo_bin("dbsetup").unwrap()
}

#[test]
fn test_setup_applies_and_reports_steps() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        dir.path(),
        &[
            ("1.sql", "CREATE TABLE {settings} (name VARCHAR(64) PRIMARY KEY, value TEXT);"),
            ("2_seed_defaults.sql", "INSERT INTO {settings} VALUES ('theme', 'dark');"),
        ],
    );

    dbsetup()
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("com.example.core: 0 -> 1"))
        .stdout(predicate::str::contains("com.example.core: 1 -> 2"))
        .stdout(predicate::str::contains("seed defaults"));

    dbsetup()
        .arg("--config")
        .arg(&config)
        .arg("--status")
        .assert()
        .success()
        .stdout(predicate::str::contains("com.example.core: 2/2"));
}

#[test]
fn test_second_run_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), &[("1.sql", "CREATE TABLE {settings} (name TEXT);")]);

    dbsetup().arg("-c").arg(&config).assert().success();
    dbsetup()
        .arg("-c")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_failing_step_exits_with_one() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), &[("1.sql", "CREATE TABLE {settings} (;")]);

    dbsetup()
        .arg("--config")
        .arg(&config)
        .arg("--quiet")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("com.example.core: migration 0 -> 1 failed"));
}

#[test]
fn test_missing_config_exits_with_two() {
    let dir = TempDir::new().unwrap();

    dbsetup()
        .arg("--config")
        .arg(dir.path().join("missing.toml"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("cannot read"));
}

#[test]
fn test_unknown_module_exits_with_two() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), &[("1.sql", "CREATE TABLE {settings} (name TEXT);")]);

    dbsetup()
        .arg("--config")
        .arg(&config)
        .args(["--module", "com.example.nope"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Unknown module: com.example.nope"));
}
