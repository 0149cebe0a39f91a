//! Child handle
//! One supervised process: launch (with the `before-start` hook), output
//! capture, the stop procedure with its grace period, and administrative
//! commands.

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::command::{self, ExecContext};
use crate::config::{AdminAction, AdminCommand, CommandLine, DaemonSpec, StdoutMode, StopMethod};
use crate::error::{Error, Result};

/// How long a child gets to react to its stop procedure before SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Monotonic run counter; lets the controller tell a fresh incarnation's
/// exit apart from a stale event of an already-reaped one.
static RUN_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Posted by the per-child wait task when the process exits.
#[derive(Debug)]
pub struct ExitEvent {
    pub daemon: String,
    pub run_id: u64,
    pub status: ExitStatus,
}

struct RunningChild {
    pid: u32,
    run_id: u64,
    started_at: Instant,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
}

/// A supervised daemon: its declared spec plus the live child, if any.
///
/// Two handles are considered equivalent for reload purposes when their
/// specs compare equal; live state never participates.
pub struct Daemon {
    spec: DaemonSpec,
    child: Option<RunningChild>,
}

impl Daemon {
    pub fn new(spec: DaemonSpec) -> Self {
        Daemon { spec, child: None }
    }

    pub fn spec(&self) -> &DaemonSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.pid)
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    fn exec_context(&self) -> ExecContext<'_> {
        ExecContext {
            argv0: self.spec.argv0.as_deref(),
            environment: self.spec.environment.as_ref(),
            extra_env: Vec::new(),
            cwd: self.spec.cwd.as_deref(),
            user: self.spec.user.as_deref(),
            group: self.spec.group.as_deref(),
        }
    }

    fn daemon_pid_env(&self) -> (String, String) {
        let pid = self
            .child
            .as_ref()
            .map(|c| c.pid.to_string())
            .unwrap_or_default();
        ("DAEMON_PID".to_string(), pid)
    }

    /// Launch the child process.
    ///
    /// Runs the `before-start` command first when one is declared; a
    /// non-zero exit aborts the start and the caller accounts it as a
    /// death. A failed spawn is reported the same way.
    pub async fn start(&mut self, exit_tx: &mpsc::UnboundedSender<ExitEvent>) -> Result<()> {
        if self.child.is_some() {
            return Err(Error::AlreadyRunning {
                daemon: self.spec.name.clone(),
            });
        }

        if let Some(hook) = self.spec.commands.get("before-start").cloned() {
            self.run_admin_action(&hook, vec![self.daemon_pid_env()])
                .await?;
        }

        let ctx = self.exec_context();
        let mut cmd = command::prepare(&self.spec.start_command, &ctx)?;
        match self.spec.stdout {
            StdoutMode::Console => {
                cmd.stdout(Stdio::inherit());
                cmd.stderr(Stdio::inherit());
            }
            StdoutMode::Devnull => {
                cmd.stdout(Stdio::null());
                cmd.stderr(Stdio::null());
            }
            StdoutMode::Log => {
                cmd.stdout(Stdio::piped());
                cmd.stderr(Stdio::piped());
            }
        }

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            command: self.spec.start_command.display(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();
        let run_id = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);

        if self.spec.stdout == StdoutMode::Log {
            if let Some(stdout) = child.stdout.take() {
                spawn_pipe_reader(self.spec.name.clone(), stdout);
            }
            if let Some(stderr) = child.stderr.take() {
                spawn_pipe_reader(self.spec.name.clone(), stderr);
            }
        }

        let (status_tx, status_rx) = watch::channel(None);
        let name = self.spec.name.clone();
        let events = exit_tx.clone();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => status,
                Err(err) => {
                    warn!(daemon = %name, error = %err, "waiting for child failed");
                    ExitStatus::from_raw(0x100)
                }
            };
            let _ = status_tx.send(Some(status));
            let _ = events.send(ExitEvent {
                daemon: name,
                run_id,
                status,
            });
        });

        info!(daemon = %self.spec.name, pid = pid, "daemon started");
        self.child = Some(RunningChild {
            pid,
            run_id,
            started_at: Instant::now(),
            exit_rx: status_rx,
        });
        Ok(())
    }

    /// Record an observed exit. Returns the uptime of the run when the
    /// event refers to the current incarnation, `None` for a stale event.
    pub fn handle_exit(&mut self, run_id: u64) -> Option<Duration> {
        match &self.child {
            Some(child) if child.run_id == run_id => {
                let uptime = child.started_at.elapsed();
                self.child = None;
                Some(uptime)
            }
            _ => None,
        }
    }

    /// Apply the stop procedure: the declared stop command or signal, a
    /// bounded grace period, then SIGKILL to the process group.
    pub async fn stop(&mut self) -> Result<()> {
        let child = match self.child.take() {
            Some(child) => child,
            None => return Ok(()),
        };
        info!(daemon = %self.spec.name, pid = child.pid, "stopping daemon");

        match self.spec.stop.clone() {
            StopMethod::Command(cmd_line) => {
                let env = vec![("DAEMON_PID".to_string(), child.pid.to_string())];
                if let Err(err) = self.run_stop_command(&cmd_line, env).await {
                    warn!(daemon = %self.spec.name, error = %err, "stop command failed");
                }
            }
            StopMethod::Signal {
                signal,
                process_group,
            } => {
                send_signal(child.pid, signal, process_group);
            }
        }

        let mut exit_rx = child.exit_rx;
        if wait_exited(&mut exit_rx, STOP_GRACE).await.is_none() {
            warn!(
                daemon = %self.spec.name,
                pid = child.pid,
                grace_secs = STOP_GRACE.as_secs(),
                "daemon did not exit within grace period, sending SIGKILL"
            );
            send_signal(child.pid, libc::SIGKILL, true);
            wait_exited(&mut exit_rx, STOP_GRACE).await;
        }
        debug!(daemon = %self.spec.name, "daemon stopped");
        Ok(())
    }

    /// Run a declared administrative command, waiting for it to finish.
    /// `DAEMON_PID` is exported, empty when the daemon is not running.
    pub async fn run_command(&mut self, name: &str) -> Result<()> {
        let command = match self.spec.commands.get(name) {
            Some(command) => command.clone(),
            None => {
                return Err(Error::UnknownCommand {
                    daemon: self.spec.name.clone(),
                    command: name.to_string(),
                })
            }
        };
        self.run_admin_action(&command, vec![self.daemon_pid_env()])
            .await
    }

    /// Run the `after-crash` hook, if declared, with either
    /// `DAEMON_EXIT_CODE` or `DAEMON_SIGNAL` describing the death.
    pub async fn run_after_crash(&mut self, status: ExitStatus) {
        let hook = match self.spec.commands.get("after-crash").cloned() {
            Some(hook) => hook,
            None => return,
        };
        let env = match (status.code(), status.signal()) {
            (Some(code), _) => vec![("DAEMON_EXIT_CODE".to_string(), code.to_string())],
            (None, Some(signal)) => vec![("DAEMON_SIGNAL".to_string(), signal.to_string())],
            (None, None) => vec![],
        };
        if let Err(err) = self.run_admin_action(&hook, env).await {
            warn!(daemon = %self.spec.name, error = %err, "after-crash command failed");
        }
    }

    async fn run_admin_action(
        &mut self,
        command: &AdminCommand,
        extra_env: Vec<(String, String)>,
    ) -> Result<()> {
        match &command.action {
            AdminAction::Signal {
                signal,
                process_group,
            } => {
                let pid = self.pid().ok_or_else(|| Error::SpecInvalid {
                    daemon: self.spec.name.clone(),
                    reason: "cannot signal a stopped daemon".to_string(),
                })?;
                send_signal(pid, *signal, *process_group);
                Ok(())
            }
            AdminAction::Command(cmd_line) => {
                let ctx = ExecContext {
                    argv0: command.argv0.as_deref(),
                    environment: command.environment.as_ref(),
                    extra_env,
                    cwd: command.cwd.as_deref(),
                    user: command.user.as_deref(),
                    group: command.group.as_deref(),
                };
                let status = run_and_wait(cmd_line, &ctx).await?;
                if status.success() {
                    Ok(())
                } else {
                    Err(Error::CommandFailed {
                        status: status.code().unwrap_or(-1),
                    })
                }
            }
        }
    }

    async fn run_stop_command(
        &mut self,
        cmd_line: &CommandLine,
        extra_env: Vec<(String, String)>,
    ) -> Result<()> {
        let ctx = ExecContext {
            argv0: self.spec.argv0.as_deref(),
            environment: self.spec.environment.as_ref(),
            extra_env,
            cwd: self.spec.cwd.as_deref(),
            user: self.spec.user.as_deref(),
            group: self.spec.group.as_deref(),
        };
        run_and_wait(cmd_line, &ctx).await.map(|_| ())
    }
}

/// Spawn a short-lived command with discarded output and wait for it.
async fn run_and_wait(line: &CommandLine, ctx: &ExecContext<'_>) -> Result<ExitStatus> {
    let mut cmd = command::prepare(line, ctx)?;
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());
    let mut child = cmd.spawn().map_err(|source| Error::Spawn {
        command: line.display(),
        source,
    })?;
    child.wait().await.map_err(Error::Io)
}

fn spawn_pipe_reader<R>(daemon: String, pipe: R)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(daemon = %daemon, "{}", line),
                Ok(None) => break,
                Err(err) => {
                    warn!(daemon = %daemon, error = %err, "error reading daemon output");
                    break;
                }
            }
        }
    });
}

fn send_signal(pid: u32, signal: i32, process_group: bool) {
    let target = if process_group {
        -(pid as i32)
    } else {
        pid as i32
    };
    let rc = unsafe { libc::kill(target, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        warn!(pid = pid, signal = signal, error = %err, "failed to send signal");
    }
}

async fn wait_exited(
    rx: &mut watch::Receiver<Option<ExitStatus>>,
    grace: Duration,
) -> Option<ExitStatus> {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if let Some(status) = *rx.borrow() {
            return Some(status);
        }
        match tokio::time::timeout_at(deadline, rx.changed()).await {
            Ok(Ok(())) => continue,
            // sender dropped: the wait task always publishes before exiting
            Ok(Err(_)) => return *rx.borrow(),
            Err(_) => return None,
        }
    }
}

/// Human-readable exit description for logs.
pub fn describe_exit(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {}", code),
        (None, Some(signal)) => format!("signal {}", signal),
        (None, None) => "unknown status".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use std::path::Path;

    fn spec(yaml: &str) -> DaemonSpec {
        config::parse(yaml, Path::new("test.yaml"))
            .unwrap()
            .into_iter()
            .next()
            .unwrap()
            .1
    }

    #[tokio::test]
    async fn start_and_stop_a_child() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut daemon = Daemon::new(spec(
            "daemons:\n  sleeper:\n    start_command: sleep 60\n    stdout: devnull\n",
        ));
        daemon.start(&tx).await.unwrap();
        assert!(daemon.is_running());
        assert!(daemon.pid().is_some());
        daemon.stop().await.unwrap();
        assert!(!daemon.is_running());
        assert_eq!(daemon.pid(), None);
    }

    #[tokio::test]
    async fn exit_event_carries_status() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut daemon = Daemon::new(spec(
            "daemons:\n  failer:\n    start_command: [/bin/sh, -c, \"exit 3\"]\n    stdout: devnull\n",
        ));
        daemon.start(&tx).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.daemon, "failer");
        assert_eq!(event.status.code(), Some(3));
        assert!(daemon.handle_exit(event.run_id).is_some());
        assert!(!daemon.is_running());
    }

    #[tokio::test]
    async fn stale_exit_event_is_ignored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut daemon = Daemon::new(spec(
            "daemons:\n  quick:\n    start_command: [/bin/true]\n    stdout: devnull\n",
        ));
        daemon.start(&tx).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert!(daemon.handle_exit(event.run_id).is_some());
        // a second delivery of the same run must not match
        assert!(daemon.handle_exit(event.run_id).is_none());
    }

    #[tokio::test]
    async fn failing_before_start_aborts() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let yaml = "\
daemons:
  guarded:
    start_command: sleep 60
    stdout: devnull
    commands:
      before-start:
        command: [/bin/false]
";
        let mut daemon = Daemon::new(spec(yaml));
        let err = daemon.start(&tx).await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
        assert!(!daemon.is_running());
    }

    #[tokio::test]
    async fn unknown_admin_command_is_an_error() {
        let mut daemon = Daemon::new(spec(
            "daemons:\n  d:\n    start_command: sleep 60\n",
        ));
        let err = daemon.run_command("rotate").await.unwrap_err();
        assert!(matches!(err, Error::UnknownCommand { .. }));
    }
}
