//! Hot reload: only daemons whose declaration changed are restarted.

mod common;

use std::time::Duration;

use serde_json::json;

use common::spawn_supervisor;

#[test]
fn reload_restarts_only_the_changed_daemon() {
    let supervisor = spawn_supervisor(
        "\
daemons:
  stable:
    start_command: sleep 600
    stdout: devnull
  volatile:
    start_command: sleep 600
    stdout: devnull
",
    );
    let stable_before = supervisor
        .wait_for_row("stable", Duration::from_secs(5), |row| row["running"] == true);
    let volatile_before = supervisor
        .wait_for_row("volatile", Duration::from_secs(5), |row| row["running"] == true);

    supervisor.rewrite_spec(
        "\
daemons:
  stable:
    start_command: sleep 600
    stdout: devnull
  volatile:
    start_command: sleep 601
    stdout: devnull
",
    );
    let reply = supervisor.control(json!({"command": "reload"}));
    assert_eq!(reply["status"], "ok");

    let stable_after = supervisor.daemon_row("stable");
    assert_eq!(stable_after["pid"], stable_before["pid"], "unchanged spec kept its child");

    let volatile_after = supervisor
        .wait_for_row("volatile", Duration::from_secs(5), |row| row["running"] == true);
    assert_ne!(
        volatile_after["pid"], volatile_before["pid"],
        "changed spec forced a new instance"
    );
}

#[test]
fn reload_adds_and_removes_daemons() {
    let supervisor = spawn_supervisor(
        "\
daemons:
  old:
    start_command: sleep 600
    stdout: devnull
",
    );
    supervisor.wait_for_row("old", Duration::from_secs(5), |row| row["running"] == true);

    supervisor.rewrite_spec(
        "\
daemons:
  fresh:
    start_command: sleep 600
    stdout: devnull
",
    );
    let reply = supervisor.control(json!({"command": "reload"}));
    assert_eq!(reply["status"], "ok");

    assert_eq!(supervisor.daemon_row("old"), json!(null), "removed daemon is gone");
    let fresh = supervisor
        .wait_for_row("fresh", Duration::from_secs(5), |row| row["running"] == true);
    assert!(fresh["pid"].as_u64().unwrap() > 0);
}

#[test]
fn reload_with_broken_spec_keeps_current_set() {
    let supervisor = spawn_supervisor(
        "\
daemons:
  keeper:
    start_command: sleep 600
    stdout: devnull
",
    );
    let before = supervisor
        .wait_for_row("keeper", Duration::from_secs(5), |row| row["running"] == true);

    supervisor.rewrite_spec("daemons: [not, a, mapping]\n");
    let reply = supervisor.control(json!({"command": "reload"}));
    // the reload itself is acknowledged; the broken file is logged and
    // the old configuration stays in force
    assert_eq!(reply["status"], "ok");
    let after = supervisor.daemon_row("keeper");
    assert_eq!(after["pid"], before["pid"]);
    assert_eq!(after["running"], json!(true));
}

#[test]
fn client_binary_renders_list() {
    let supervisor = spawn_supervisor(
        "\
daemons:
  solo:
    start_command: sleep 600
    stdout: devnull
",
    );
    supervisor.wait_for_row("solo", Duration::from_secs(5), |row| row["running"] == true);

    let output = std::process::Command::new(env!("CARGO_BIN_EXE_daemonshepherd"))
        .arg("--socket")
        .arg(&supervisor.socket)
        .arg("list")
        .output()
        .expect("run client");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"solo\""), "unexpected output: {}", stdout);
}

#[test]
fn client_binary_reports_errors_with_exit_1() {
    let supervisor = spawn_supervisor(
        "\
daemons:
  solo:
    start_command: sleep 600
    stdout: devnull
",
    );
    let output = std::process::Command::new(env!("CARGO_BIN_EXE_daemonshepherd"))
        .arg("--socket")
        .arg(&supervisor.socket)
        .arg("start")
        .arg("ghost")
        .output()
        .expect("run client");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error"), "unexpected stderr: {}", stderr);
}
