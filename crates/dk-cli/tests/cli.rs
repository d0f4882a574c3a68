use assert_cmd::Command;

fn dk() -> Command {
    let mut cmd = Command::cargo_bin("dk").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn init_writes_sample_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    dk().arg("init").arg(&path).assert().success();

    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("[gateway]"));
    assert!(written.contains("[backend]"));
}

#[test]
fn init_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "# mine\n").unwrap();

    let out = dk().arg("init").arg(&path).output().unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("already exists"));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "# mine\n");
}

#[test]
fn backend_fails_without_backend_section() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[gateway]\nserv_port = 35350\n").unwrap();

    let out = dk().arg("backend").arg("--config").arg(&path).output().unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("missing [backend] section"));
}

#[test]
fn backend_fails_on_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");

    let out = dk().arg("backend").arg("--config").arg(&path).output().unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("failed to read config"));
}
