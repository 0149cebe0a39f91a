//! Shared helpers for the end-to-end tests.
//!
//! Each test gets its own supervisor instance running against a scratch
//! spec file and a scratch control socket, so tests can run in parallel.
//! The guard kills the supervisor on drop and, when the test is
//! panicking, dumps the supervisor's log to stderr first.

// not every test binary uses every helper
#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use serde_json::Value;
use tempfile::TempDir;

pub struct Supervisor {
    child: Child,
    pub socket: PathBuf,
    pub spec_path: PathBuf,
    log_path: PathBuf,
    dir: TempDir,
}

/// Write the spec file and start a supervisor on it. A literal `{dir}`
/// in the spec is replaced with the scratch directory path.
pub fn spawn_supervisor(spec_yaml: &str) -> Supervisor {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec_path = dir.path().join("daemons.yaml");
    let socket = dir.path().join("control.sock");
    let log_path = dir.path().join("supervisor.log");
    let spec_yaml = spec_yaml.replace("{dir}", &dir.path().display().to_string());
    std::fs::write(&spec_path, spec_yaml).expect("write spec");

    let log = std::fs::File::create(&log_path).expect("create log");
    let child = Command::new(env!("CARGO_BIN_EXE_daemonshepherd"))
        .arg("--daemons")
        .arg(&spec_path)
        .arg("--socket")
        .arg(&socket)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(log)
        .env("RUST_LOG", "debug")
        .spawn()
        .expect("spawn daemonshepherd");

    let supervisor = Supervisor {
        child,
        socket,
        spec_path,
        log_path,
        dir,
    };
    supervisor.wait_for_socket();
    supervisor
}

impl Supervisor {
    fn wait_for_socket(&self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if self.socket.exists() {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("control socket never appeared at {}", self.socket.display());
    }

    /// One request, one reply, connection closed.
    pub fn control(&self, request: Value) -> Value {
        let mut stream = UnixStream::connect(&self.socket).expect("connect control socket");
        let mut payload = request.to_string();
        payload.push('\n');
        stream.write_all(payload.as_bytes()).expect("send request");

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).expect("read reply");
        serde_json::from_str(&line).expect("parse reply")
    }

    /// `list` reply row for one daemon.
    pub fn daemon_row(&self, name: &str) -> Value {
        let reply = self.control(serde_json::json!({"command": "list"}));
        assert_eq!(reply["status"], "ok", "list failed: {}", reply);
        reply["result"]
            .as_array()
            .expect("list result")
            .iter()
            .find(|row| row["daemon"] == name)
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Poll `list` until the predicate holds or the timeout elapses.
    pub fn wait_for_row<F>(&self, name: &str, timeout: Duration, predicate: F) -> Value
    where
        F: Fn(&Value) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let row = self.daemon_row(name);
            if predicate(&row) {
                return row;
            }
            if Instant::now() >= deadline {
                panic!("condition never held for '{}', last row: {}", name, row);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// Rewrite the spec file in place (for reload tests).
    pub fn rewrite_spec(&self, spec_yaml: &str) {
        std::fs::write(&self.spec_path, spec_yaml).expect("rewrite spec");
    }

    pub fn scratch_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if std::thread::panicking() {
            if let Ok(log) = std::fs::read_to_string(&self.log_path) {
                eprintln!("===== supervisor log =====");
                for line in log.lines().rev().take(50).collect::<Vec<_>>().iter().rev() {
                    eprintln!("{}", line);
                }
                eprintln!("==========================");
            }
        }
        unsafe {
            libc::kill(self.child.id() as i32, libc::SIGTERM);
        }
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(50))
                }
                _ => {
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                    break;
                }
            }
        }
    }
}
