//! Controller loop
//! Binds the daemons, the restart queue and the control socket into one
//! cooperative event loop. Child exits arrive on an unbounded channel fed
//! by per-child wait tasks; the loop never misses a reap.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{self, DaemonSpec, RESERVED_COMMANDS};
use crate::control::{self, ControlSocket, Request};
use crate::daemon::{describe_exit, Daemon, ExitEvent};
use crate::error::{Error, Result};
use crate::restart::RestartQueue;

/// Default poll tick; the loop wakes at least this often.
const POLL_TICK: Duration = Duration::from_secs(1);

/// How long a control client gets to deliver its one request line.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

enum LoopEvent {
    Tick,
    ChildExit(ExitEvent),
    Connection(std::io::Result<UnixStream>),
    Reload,
    Shutdown(&'static str),
}

/// Supervisor state: the daemons map, the restart queue and the control
/// channel. Owned by a single task; signal handlers only feed the loop.
pub struct Controller {
    spec_path: PathBuf,
    daemons: BTreeMap<String, Daemon>,
    queue: RestartQueue,
    socket: Option<ControlSocket>,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
    exit_rx: Option<mpsc::UnboundedReceiver<ExitEvent>>,
}

impl Controller {
    /// Load the spec file and bind the control socket. Both failures are
    /// startup errors and surface to the caller.
    pub fn new(spec_path: &Path, socket_path: Option<&Path>) -> Result<Self> {
        let specs = config::load(spec_path)?;
        let socket = match socket_path {
            Some(path) => Some(ControlSocket::bind(path)?),
            None => None,
        };
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        let mut queue = RestartQueue::new();
        let mut daemons = BTreeMap::new();
        for (name, spec) in specs {
            queue.add(&name, spec.restart.clone(), spec.start_priority);
            daemons.insert(name, Daemon::new(spec));
        }

        Ok(Controller {
            spec_path: spec_path.to_path_buf(),
            daemons,
            queue,
            socket,
            exit_tx,
            exit_rx: Some(exit_rx),
        })
    }

    /// Run until SIGINT or SIGTERM, then stop every child.
    pub async fn run(&mut self) -> Result<()> {
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut exit_rx = self
            .exit_rx
            .take()
            .expect("controller can only be run once");

        self.start_all().await;

        loop {
            let event = self.next_event(&mut exit_rx, &mut sighup, &mut sigint, &mut sigterm).await;
            match event {
                LoopEvent::Tick => self.start_due().await,
                LoopEvent::ChildExit(exit) => self.handle_child_exit(exit).await,
                LoopEvent::Connection(Ok(stream)) => self.handle_connection(stream).await,
                LoopEvent::Connection(Err(err)) => {
                    warn!(error = %err, "control socket accept failed");
                }
                LoopEvent::Reload => {
                    info!("got SIGHUP, reloading daemons spec");
                    self.reload().await;
                }
                LoopEvent::Shutdown(sig) => {
                    info!(signal = sig, "shutting down");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn next_event(
        &mut self,
        exit_rx: &mut mpsc::UnboundedReceiver<ExitEvent>,
        sighup: &mut Signal,
        sigint: &mut Signal,
        sigterm: &mut Signal,
    ) -> LoopEvent {
        let now = Instant::now();
        let deadline = match self.queue.next_deadline() {
            Some(at) => at.min(now + POLL_TICK),
            None => now + POLL_TICK,
        };
        let socket = &self.socket;

        tokio::select! {
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                LoopEvent::Tick
            }
            exit = exit_rx.recv() => match exit {
                Some(exit) => LoopEvent::ChildExit(exit),
                // we hold a sender, so this cannot happen
                None => LoopEvent::Tick,
            },
            conn = async {
                match socket {
                    Some(socket) => socket.accept().await,
                    None => std::future::pending().await,
                }
            } => LoopEvent::Connection(conn),
            _ = sighup.recv() => LoopEvent::Reload,
            _ = sigint.recv() => LoopEvent::Shutdown("SIGINT"),
            _ = sigterm.recv() => LoopEvent::Shutdown("SIGTERM"),
        }
    }

    /// Boot: start every declared daemon in ascending start priority.
    async fn start_all(&mut self) {
        for name in self.names_by_priority() {
            if !self.daemons[&name].is_running() {
                self.start_daemon(&name, None).await;
            }
        }
    }

    fn names_by_priority(&self) -> Vec<String> {
        let mut names: Vec<&DaemonSpec> = self.daemons.values().map(Daemon::spec).collect();
        names.sort_by(|a, b| {
            a.start_priority
                .cmp(&b.start_priority)
                .then_with(|| a.name.cmp(&b.name))
        });
        names.into_iter().map(|spec| spec.name.clone()).collect()
    }

    /// Launch one daemon; a failed start counts as an immediate death and
    /// goes through the backoff schedule.
    async fn start_daemon(&mut self, name: &str, scheduled_backoff: Option<u64>) {
        let daemon = match self.daemons.get_mut(name) {
            Some(daemon) => daemon,
            None => return,
        };
        match daemon.start(&self.exit_tx).await {
            Ok(()) => {
                self.queue.started(name, Instant::now(), scheduled_backoff);
            }
            Err(err) => {
                error!(daemon = %name, error = %err, "failed to start daemon");
                self.queue.died(name, Instant::now());
            }
        }
    }

    /// Release and start every daemon whose restart timer has fired.
    async fn start_due(&mut self) {
        let ready = self.queue.due(Instant::now());
        for (name, backoff) in ready {
            debug!(daemon = %name, "restart timer fired");
            self.start_daemon(&name, Some(backoff)).await;
        }
    }

    async fn handle_child_exit(&mut self, exit: ExitEvent) {
        let daemon = match self.daemons.get_mut(&exit.daemon) {
            Some(daemon) => daemon,
            None => return, // removed by a reload in the meantime
        };
        if daemon.handle_exit(exit.run_id).is_none() {
            // already reaped through an explicit stop
            return;
        }
        warn!(
            daemon = %exit.daemon,
            status = %describe_exit(exit.status),
            "daemon exited unexpectedly"
        );
        daemon.run_after_crash(exit.status).await;
        self.queue.died(&exit.daemon, Instant::now());
    }

    /// Stop a daemon through its declared stop procedure and record the
    /// stop so no restart is scheduled.
    async fn stop_daemon(&mut self, name: &str) {
        if let Some(daemon) = self.daemons.get_mut(name) {
            if let Err(err) = daemon.stop().await {
                warn!(daemon = %name, error = %err, "stop procedure failed");
            }
            self.queue.stopped(name);
            self.queue.cancel_restart(name);
        }
    }

    /// Re-read the spec file and converge the running set. A spec file
    /// that fails to load leaves the current configuration in force.
    pub async fn reload(&mut self) {
        info!(path = %self.spec_path.display(), "reloading daemons spec");
        let new_specs = match config::load(&self.spec_path) {
            Ok(specs) => specs,
            Err(err) => {
                error!(error = %err, "reload failed, keeping current spec");
                return;
            }
        };

        // stop removed and changed daemons first, in descending priority
        let mut to_stop: Vec<String> = Vec::new();
        for (name, daemon) in &self.daemons {
            match new_specs.get(name) {
                None => to_stop.push(name.clone()),
                Some(new_spec) if new_spec != daemon.spec() => to_stop.push(name.clone()),
                Some(_) => {} // unchanged: untouched, even mid-backoff
            }
        }
        let mut stop_order = self.names_by_priority();
        stop_order.reverse();
        for name in stop_order {
            if !to_stop.contains(&name) {
                continue;
            }
            info!(daemon = %name, "spec removed or changed, stopping instance");
            self.stop_daemon(&name).await;
            if !new_specs.contains_key(&name) {
                self.daemons.remove(&name);
                self.queue.remove(&name);
            }
        }

        // adopt new and changed specs, then start whatever is not running
        let mut fresh: Vec<String> = Vec::new();
        for (name, spec) in new_specs {
            let changed = match self.daemons.get(&name) {
                Some(daemon) => daemon.spec() != &spec,
                None => true,
            };
            if changed {
                self.queue
                    .add(&name, spec.restart.clone(), spec.start_priority);
                self.daemons.insert(name.clone(), Daemon::new(spec));
                fresh.push(name);
            }
        }
        for name in self.names_by_priority() {
            if fresh.contains(&name) && !self.daemons[&name].is_running() {
                info!(daemon = %name, "starting daemon after reload");
                self.start_daemon(&name, None).await;
            }
        }
    }

    /// Orderly shutdown: every child gets its stop procedure, highest
    /// start priority first.
    async fn shutdown(&mut self) {
        let mut order = self.names_by_priority();
        order.reverse();
        for name in order {
            if self.daemons[&name].is_running() {
                self.stop_daemon(&name).await;
            }
        }
        // unlinks the socket file
        self.socket.take();
    }

    async fn handle_connection(&mut self, stream: UnixStream) {
        let mut stream = BufReader::new(stream);
        let request = tokio::time::timeout(REQUEST_TIMEOUT, control::read_request(&mut stream));
        let reply = match request.await {
            Err(_) => control::reply_error("request timed out"),
            Ok(Err(err)) => control::reply_error(err.to_string()),
            Ok(Ok(None)) => return, // client went away
            Ok(Ok(Some(request))) => self.dispatch(request).await,
        };
        if let Err(err) = control::send_reply(&mut stream, &reply).await {
            debug!(error = %err, "failed to send control reply");
        }
    }

    async fn dispatch(&mut self, request: Request) -> Value {
        match request {
            Request::Reload => {
                self.reload().await;
                control::reply_ok()
            }
            Request::List => control::reply_result(self.list_daemons()),
            Request::Start { daemon } => self.command_start(&daemon).await,
            Request::Stop { daemon } => self.command_stop(&daemon).await,
            Request::Restart { daemon } => self.command_restart(&daemon).await,
            Request::CancelRestart { daemon } => {
                if !self.daemons.contains_key(&daemon) {
                    return unknown_daemon(&daemon);
                }
                self.queue.cancel_restart(&daemon);
                control::reply_ok()
            }
            Request::ListCommands { daemon } => match self.daemons.get(&daemon) {
                Some(handle) => control::reply_result(json!(handle.spec().admin_command_names())),
                None => unknown_daemon(&daemon),
            },
            Request::AdminCommand {
                daemon,
                admin_command,
            } => self.command_admin(&daemon, &admin_command).await,
        }
    }

    fn list_daemons(&self) -> Value {
        let now = Instant::now();
        let epoch_now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let rows: Vec<Value> = self
            .daemons
            .values()
            .map(|daemon| {
                let restart_at = self.queue.restart_at(daemon.name()).map(|at| {
                    epoch_now + at.saturating_duration_since(now).as_secs()
                });
                json!({
                    "daemon": daemon.name(),
                    "pid": daemon.pid(),
                    "running": daemon.is_running(),
                    "restart_at": restart_at,
                })
            })
            .collect();
        json!(rows)
    }

    async fn command_start(&mut self, name: &str) -> Value {
        if !self.daemons.contains_key(name) {
            return unknown_daemon(name);
        }
        // a start cancels any pending restart and resets the backoff,
        // whether or not the daemon was already running
        self.queue.cancel_restart(name);
        if self.daemons[name].is_running() {
            return control::reply_ok();
        }
        info!(daemon = %name, "manual start");
        self.start_daemon(name, None).await;
        match self.daemons[name].is_running() {
            true => control::reply_ok(),
            false => control::reply_error("start failed"),
        }
    }

    async fn command_stop(&mut self, name: &str) -> Value {
        if !self.daemons.contains_key(name) {
            return unknown_daemon(name);
        }
        info!(daemon = %name, "manual stop");
        self.stop_daemon(name).await;
        control::reply_ok()
    }

    async fn command_restart(&mut self, name: &str) -> Value {
        if !self.daemons.contains_key(name) {
            return unknown_daemon(name);
        }
        info!(daemon = %name, "manual restart");
        if self.daemons[name].is_running() {
            // force stop, then immediate re-start from the head of the
            // backoff schedule
            self.stop_daemon(name).await;
            self.start_daemon(name, None).await;
        } else if self.queue.release_waiting(name) {
            // waiting for a timer: start now, keep the backoff position
            self.start_daemon(name, None).await;
        } else {
            self.queue.cancel_restart(name);
            self.start_daemon(name, None).await;
        }
        match self.daemons[name].is_running() {
            true => control::reply_ok(),
            false => control::reply_error("restart failed"),
        }
    }

    async fn command_admin(&mut self, name: &str, command: &str) -> Value {
        if RESERVED_COMMANDS.contains(&command) {
            return control::reply_error(format!("command '{}' is reserved", command));
        }
        let daemon = match self.daemons.get_mut(name) {
            Some(daemon) => daemon,
            None => return unknown_daemon(name),
        };
        match daemon.run_command(command).await {
            Ok(()) => control::reply_ok(),
            Err(err) => control::reply_error(err.to_string()),
        }
    }
}

fn unknown_daemon(name: &str) -> Value {
    control::reply_error(Error::UnknownDaemon(name.to_string()).to_string())
}
