//! Behavioural tests for the `s3conf` binary, using local paths as the remote.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn s3conf(dir: &TempDir) -> assert_cmd::Command {
  let mut cmd = cargo_bin_cmd!("s3conf");
  cmd
    .current_dir(dir.path())
    .env_remove("S3CONF")
    .env_remove("S3CONF_MAP")
    .env_remove("S3CONF_CONFIG_FILE")
    .env_remove("RUST_LOG");
  cmd
}

#[test]
fn env_prints_remote_variables() {
  let dir = TempDir::new().unwrap();
  let remote = dir.path().join("remote.env");
  fs::write(&remote, "# comment\nB=two words\nA=\"x\\ty\"\n").unwrap();

  s3conf(&dir)
    .arg("env")
    .env("S3CONF", &remote)
    .assert()
    .success()
    .stdout("A='x\ty'\nB='two words'\n");
}

#[test]
fn env_without_envfile_setting_fails() {
  let dir = TempDir::new().unwrap();

  s3conf(&dir)
    .arg("env")
    .assert()
    .failure()
    .stderr(predicate::str::contains("EnvfilePathNotDefined"));
}

#[test]
fn env_phusion_dump_writes_one_file_per_variable() {
  let dir = TempDir::new().unwrap();
  let remote = dir.path().join("remote.env");
  fs::write(&remote, "HOST=localhost\nPORT=8080\n").unwrap();
  let dump = dir.path().join("container_environment");

  s3conf(&dir)
    .args(["env", "--quiet", "--phusion-dump"])
    .arg(&dump)
    .env("S3CONF", &remote)
    .assert()
    .success()
    .stdout("");

  assert_eq!(fs::read_to_string(dump.join("HOST")).unwrap(), "localhost\n");
  assert_eq!(fs::read_to_string(dump.join("PORT")).unwrap(), "8080\n");
}

#[test]
fn init_then_set_through_config_section() {
  let dir = TempDir::new().unwrap();
  let remote = dir.path().join("remote/dev.env");

  s3conf(&dir)
    .args(["init", "dev"])
    .arg(&remote)
    .assert()
    .success();
  assert!(dir.path().join(".s3conf/config.toml").is_file());

  s3conf(&dir)
    .args(["set", "dev", "KEY=value", "--create"])
    .assert()
    .success();
  assert_eq!(fs::read_to_string(&remote).unwrap(), "KEY=value\n");

  s3conf(&dir)
    .args(["env", "dev", "--export"])
    .assert()
    .success()
    .stdout("export KEY=value\n");

  s3conf(&dir)
    .args(["unset", "dev", "KEY"])
    .assert()
    .success();
  assert_eq!(fs::read_to_string(&remote).unwrap(), "");
}

#[test]
fn set_rejects_malformed_assignment() {
  let dir = TempDir::new().unwrap();

  s3conf(&dir)
    .args(["set", "dev", "NOVALUE"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("InvalidAssignment"));
}

#[test]
fn downsync_uses_map_override() {
  let dir = TempDir::new().unwrap();
  fs::create_dir_all(dir.path().join("remote/files")).unwrap();
  fs::write(dir.path().join("remote/files/app.conf"), "app").unwrap();
  fs::write(dir.path().join("remote/dev.env"), "").unwrap();

  s3conf(&dir)
    .args(["init", "dev"])
    .arg(dir.path().join("remote/dev.env"))
    .assert()
    .success();

  let map = format!("{}/remote/files/:out/", dir.path().display());
  s3conf(&dir)
    .args(["downsync", "dev", "--map", &map, "--root-dir"])
    .arg(dir.path().join("root"))
    .assert()
    .success();

  assert_eq!(
    fs::read_to_string(dir.path().join("root/out/app.conf")).unwrap(),
    "app"
  );
}

#[cfg(unix)]
#[test]
fn exec_passes_environment_and_exit_code() {
  let dir = TempDir::new().unwrap();
  let remote = dir.path().join("remote/dev.env");
  fs::create_dir_all(remote.parent().unwrap()).unwrap();
  fs::write(&remote, "GREETING=hello\n").unwrap();

  s3conf(&dir).args(["init", "dev"]).arg(&remote).assert().success();

  s3conf(&dir)
    .args(["exec", "dev", "--", "sh", "-c", "echo $GREETING; exit 3"])
    .assert()
    .code(3)
    .stdout("hello\n");
}
