//! Control protocol end-to-end: list, start/stop, admin commands, and
//! error reporting.

mod common;

use std::time::Duration;

use serde_json::json;

use common::spawn_supervisor;

const TWO_SLEEPERS: &str = "\
daemons:
  alpha:
    start_command: sleep 600
    stdout: devnull
  beta:
    start_command: sleep 600
    stdout: devnull
";

#[test]
fn list_shows_running_daemons() {
    let supervisor = spawn_supervisor(TWO_SLEEPERS);
    for name in ["alpha", "beta"] {
        let row = supervisor.wait_for_row(name, Duration::from_secs(5), |row| {
            row["running"] == true
        });
        assert!(row["pid"].as_u64().unwrap() > 0);
        assert_eq!(row["restart_at"], json!(null));
    }
}

#[test]
fn stop_and_start_roundtrip() {
    let supervisor = spawn_supervisor(TWO_SLEEPERS);
    supervisor.wait_for_row("alpha", Duration::from_secs(5), |row| row["running"] == true);

    let reply = supervisor.control(json!({"command": "stop", "daemon": "alpha"}));
    assert_eq!(reply["status"], "ok");
    let row = supervisor.daemon_row("alpha");
    assert_eq!(row["running"], json!(false));
    assert_eq!(row["pid"], json!(null));

    // beta is untouched
    assert_eq!(supervisor.daemon_row("beta")["running"], json!(true));

    let reply = supervisor.control(json!({"command": "start", "daemon": "alpha"}));
    assert_eq!(reply["status"], "ok");
    let row = supervisor.daemon_row("alpha");
    assert_eq!(row["running"], json!(true));
}

#[test]
fn restart_changes_pid() {
    let supervisor = spawn_supervisor(TWO_SLEEPERS);
    let before = supervisor
        .wait_for_row("alpha", Duration::from_secs(5), |row| row["running"] == true);
    let reply = supervisor.control(json!({"command": "restart", "daemon": "alpha"}));
    assert_eq!(reply["status"], "ok");
    let after = supervisor.daemon_row("alpha");
    assert_eq!(after["running"], json!(true));
    assert_ne!(after["pid"], before["pid"]);
}

#[test]
fn unknown_daemon_is_reported() {
    let supervisor = spawn_supervisor(TWO_SLEEPERS);
    let reply = supervisor.control(json!({"command": "start", "daemon": "ghost"}));
    assert_eq!(reply["status"], "error");
    assert!(reply["reason"].as_str().unwrap().contains("ghost"));
}

#[test]
fn malformed_json_is_reported() {
    let supervisor = spawn_supervisor(TWO_SLEEPERS);
    use std::io::{BufRead, BufReader, Write};
    let mut stream = std::os::unix::net::UnixStream::connect(&supervisor.socket).unwrap();
    stream.write_all(b"{this is not json\n").unwrap();
    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line).unwrap();
    let reply: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(reply["status"], "error");
}

#[test]
fn unknown_command_is_reported() {
    let supervisor = spawn_supervisor(TWO_SLEEPERS);
    let reply = supervisor.control(json!({"command": "explode"}));
    assert_eq!(reply["status"], "error");
}

#[test]
fn admin_command_runs_with_daemon_pid() {
    let supervisor = spawn_supervisor(
        "\
daemons:
  worker:
    start_command: sleep 600
    stdout: devnull
    commands:
      checkpoint:
        command: sh -c 'echo \"pid=$DAEMON_PID\" > {dir}/checkpoint.out'
",
    );
    let row =
        supervisor.wait_for_row("worker", Duration::from_secs(5), |row| row["running"] == true);
    let pid = row["pid"].as_u64().unwrap();

    let reply = supervisor.control(json!({"command": "list-commands", "daemon": "worker"}));
    assert_eq!(reply["status"], "ok");
    assert_eq!(reply["result"], json!(["checkpoint"]));

    let reply = supervisor.control(
        json!({"command": "admin_command", "daemon": "worker", "admin_command": "checkpoint"}),
    );
    assert_eq!(reply["status"], "ok", "admin command failed: {}", reply);
    let contents = std::fs::read_to_string(supervisor.scratch_path("checkpoint.out")).unwrap();
    assert_eq!(contents.trim(), format!("pid={}", pid));
}

#[test]
fn reserved_commands_are_not_dispatchable() {
    let supervisor = spawn_supervisor(
        "\
daemons:
  worker:
    start_command: sleep 600
    stdout: devnull
    commands:
      before-start:
        command: [/bin/true]
",
    );
    let reply = supervisor.control(
        json!({"command": "admin_command", "daemon": "worker", "admin_command": "before-start"}),
    );
    assert_eq!(reply["status"], "error");
}
