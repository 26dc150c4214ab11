use assert_cmd::cargo::cargo_bin_cmd;

fn fixture(path: &str) -> String {
    format!("{}/tests/fixtures/{path}", env!("CARGO_MANIFEST_DIR"))
}

#[test]
fn help_lists_flags() {
    let mut cmd = cargo_bin_cmd!("alarm");
    cmd.arg("--help");
    let out = cmd.assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");

    assert!(stdout.contains("--config"));
    assert!(stdout.contains("--data-dir"));
    assert!(stdout.contains("--no-audio"));
}

#[test]
fn button_press_session_exits_zero() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("alarm");
    cmd.arg("--config")
        .arg(fixture("configs/single-action.toml"))
        .arg("--data-dir")
        .arg(dir.path())
        .write_stdin("\n");
    cmd.assert().success();
    assert!(dir.path().join("morning_check_raw.jsonl").exists());
}

#[test]
fn closed_stdin_aborts_with_exit_two() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("alarm");
    cmd.arg("--config")
        .arg(fixture("configs/sequence.toml"))
        .arg("--data-dir")
        .arg(dir.path())
        .write_stdin("");
    cmd.assert().code(2);
}

#[test]
fn invalid_config_exits_one() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("alarm");
    cmd.arg("--config")
        .arg(fixture("configs/invalid-empty-sequence.toml"))
        .arg("--data-dir")
        .arg(dir.path());
    let out = cmd.assert().code(1);
    let stderr = String::from_utf8(out.get_output().stderr.clone()).expect("utf8");
    assert!(stderr.contains("configuration error"));
}

#[test]
fn unknown_flag_exits_one() {
    let mut cmd = cargo_bin_cmd!("alarm");
    cmd.arg("--volume").arg("11");
    cmd.assert().code(1);
}
