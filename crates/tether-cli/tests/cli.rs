use assert_cmd::Command;

fn tether(config_dir: &tempfile::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("tether").unwrap();
    cmd.env_remove("TETHER_SECRET")
        .env_remove("TETHER_API_KEY")
        .arg("--config")
        .arg(config_dir.path().join("config.toml"));
    cmd
}

#[test]
fn help_lists_subcommands() {
    let output = Command::cargo_bin("tether")
        .unwrap()
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for sub in ["backends", "send", "serve"] {
        assert!(stdout.contains(sub), "missing {sub} in help");
    }
}

#[test]
fn missing_secret_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let output = tether(&dir).arg("backends").output().unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no gateway secret"));
}

#[test]
fn unparsable_config_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.toml"), "[default\n").unwrap();
    let output = tether(&dir).arg("backends").output().unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to parse config"));
}

#[test]
fn send_requires_an_api_key() {
    let dir = tempfile::tempdir().unwrap();
    let output = tether(&dir)
        .args(["--secret", "S", "send", "backend_x", "hi"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn unreachable_gateway_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let output = tether(&dir)
        .args(["--secret", "S", "--gateway", &format!("ws://{addr}"), "backends"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to connect"));
}
