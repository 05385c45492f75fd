use std::process::Command;

fn upgraded() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_upgraded"));
    cmd.env_remove("ROLLOUT_URL");
    cmd
}

#[test]
fn revision_needs_no_other_flags() {
    let output = upgraded().arg("-v").output().unwrap();

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(
        stdout.trim().starts_with(env!("CARGO_PKG_VERSION")),
        "unexpected revision {:?}",
        stdout
    );
}

#[test]
fn daemon_needs_rollout_url() {
    let output = upgraded().arg("--root").arg("/nonexistent").output().unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("--rollout-url"));
}
