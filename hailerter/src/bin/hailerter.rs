//! hailerter binary
//!
//! Server mode reads monitoring messages on stdin and emits notification
//! lines on stdout; logs go to stderr so the output stream stays clean.
//! Client mode sends one administrative command to a running instance's
//! control socket.

use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

use hailerter::control::{self, ControlSocket};
use hailerter::duration::{parse_duration, parse_fraction};
use hailerter::flow::MAX_FLAP_WINDOW;
use hailerter::message::{Message, Notification};
use hailerter::tracker::{StateTracker, TrackerOptions};

/// How long a control client gets to deliver its one request line.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

fn parse_window(input: &str) -> Result<u32, String> {
    let window: u32 = input.parse().map_err(|_| "not an integer".to_string())?;
    if window < 1 || window > MAX_FLAP_WINDOW {
        return Err(format!("flapping window must be in 1..={}", MAX_FLAP_WINDOW));
    }
    Ok(window)
}

#[derive(Debug, Parser)]
#[command(
    name = "hailerter",
    about = "Track monitoring streams and emit status-change notifications"
)]
struct Cli {
    /// Control socket path
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Do not notify about a flow whose first-ever state is an error
    #[arg(long)]
    skip_initial_error: bool,

    /// Re-notify about a still-degraded flow this often
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    remind_interval: Option<i64>,

    /// Treat warning severity as an ok status
    #[arg(long)]
    warning_expected: bool,

    /// Interval assumed for messages that do not carry one
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    default_interval: Option<i64>,

    /// Declare a flow missing after this many intervals without messages
    #[arg(long, value_name = "COUNT")]
    missing: Option<i64>,

    /// Number of messages in the flap-detection window
    #[arg(long, value_name = "COUNT", value_parser = parse_window)]
    flapping_window: Option<u32>,

    /// Fraction of status changes in the window that counts as flapping
    #[arg(long, value_name = "FRACTION", value_parser = parse_fraction)]
    flapping_threshold: Option<f64>,

    #[command(subcommand)]
    command: Option<ClientCommand>,
}

#[derive(Debug, Subcommand)]
enum ClientCommand {
    /// List tracked flows with their current status
    List,
    /// Drop a flow's record entirely
    Forget { aspect: String, location: String },
    /// List muted flows with their expiry times
    ListMuted,
    /// Suppress notifications for a flow for a while
    Mute {
        aspect: String,
        location: String,
        duration: String,
    },
    /// Lift a mute before it expires
    Unmute { aspect: String, location: String },
    /// Zero a flow's flap detector
    ResetFlapping { aspect: String, location: String },
    /// Zero a flow's notification stamp
    ResetReminder { aspect: String, location: String },
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Log a stack representation before dying on a programming error.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        tracing::error!("panic: {}\n{}", panic_info, backtrace);
        default_hook(panic_info);
    }));
}

fn main() -> anyhow::Result<()> {
    let mut cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    match cli.command.take() {
        Some(command) => runtime.block_on(client_main(cli, command)),
        None => runtime.block_on(server_main(cli)),
    }
}

async fn server_main(cli: Cli) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    install_panic_hook();

    let options = TrackerOptions {
        skip_initial_error: cli.skip_initial_error,
        remind_interval: cli.remind_interval,
        warning_expected: cli.warning_expected,
        default_interval: cli.default_interval,
        missing_multiple: cli.missing,
        flap_window: cli.flapping_window.unwrap_or(10),
        flap_threshold: cli.flapping_threshold.unwrap_or(0.75),
    };
    let mut tracker = StateTracker::new(options);

    let socket = match cli.socket.as_deref() {
        Some(path) => Some(ControlSocket::bind(path)?),
        None => None,
    };

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    // drives the timeout sweep once a wall-clock second
    let mut sweep_tick = tokio::time::interval(Duration::from_secs(1));
    sweep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!("hailerter started");
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(&line) {
                        Ok(value) => {
                            let now = now_epoch();
                            if let Some(message) = Message::from_value(value) {
                                let notifications = tracker.handle_message(&message, now);
                                if !publish(&notifications) {
                                    break; // EPIPE downstream
                                }
                            } else {
                                debug!("dropping non-message input line");
                            }
                        }
                        Err(err) => {
                            // a broken producer upstream; close input and
                            // wind down
                            error!(error = %err, "malformed JSON on stdin, closing input");
                            break;
                        }
                    }
                }
                Ok(None) => {
                    info!("stdin closed, exiting");
                    break;
                }
                Err(err) => {
                    error!(error = %err, "error reading stdin, exiting");
                    break;
                }
            },
            _ = sweep_tick.tick() => {
                let notifications = tracker.sweep(now_epoch());
                if !publish(&notifications) {
                    break;
                }
            }
            conn = async {
                match &socket {
                    Some(socket) => socket.accept().await,
                    None => std::future::pending().await,
                }
            } => match conn {
                Ok(stream) => handle_connection(&mut tracker, stream).await,
                Err(err) => warn!(error = %err, "control socket accept failed"),
            },
            _ = sighup.recv() => {
                info!("got SIGHUP, exiting");
                break;
            }
            _ = sigint.recv() => {
                info!("got SIGINT, exiting");
                break;
            }
            _ = sigterm.recv() => {
                info!("got SIGTERM, exiting");
                break;
            }
        }
    }
    Ok(())
}

/// Write notification lines to stdout. A broken pipe downstream is an
/// orderly-exit signal; returns false in that case.
fn publish(notifications: &[Notification]) -> bool {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for notification in notifications {
        let line = match serde_json::to_string(notification) {
            Ok(line) => line,
            Err(err) => {
                error!(error = %err, "cannot serialize notification");
                continue;
            }
        };
        if let Err(err) = writeln!(out, "{}", line) {
            if err.kind() == std::io::ErrorKind::BrokenPipe {
                info!("output pipe closed, exiting");
                return false;
            }
            error!(error = %err, "cannot write notification");
        }
    }
    if let Err(err) = out.flush() {
        if err.kind() == std::io::ErrorKind::BrokenPipe {
            return false;
        }
    }
    true
}

async fn handle_connection(tracker: &mut StateTracker, stream: tokio::net::UnixStream) {
    let mut stream = BufReader::new(stream);
    let request = tokio::time::timeout(REQUEST_TIMEOUT, control::read_request(&mut stream));
    let reply = match request.await {
        Err(_) | Ok(Err(_)) => control::bad_request(),
        Ok(Ok(None)) => return, // client went away
        Ok(Ok(Some(request))) => control::dispatch(tracker, &request, now_epoch()),
    };
    if let Err(err) = control::send_reply(&mut stream, &reply).await {
        debug!(error = %err, "failed to send control reply");
    }
}

async fn client_main(cli: Cli, command: ClientCommand) -> anyhow::Result<()> {
    let socket = cli.socket.context("client mode requires --socket PATH")?;

    let parse_location = |location: &str| -> anyhow::Result<Map<String, Value>> {
        let value: Value = serde_json::from_str(location)
            .with_context(|| format!("location is not JSON: {}", location))?;
        match value {
            Value::Object(map) => Ok(map),
            _ => bail!("location must be a JSON object"),
        }
    };

    let request = match &command {
        ClientCommand::List => json!({"command": "list"}),
        ClientCommand::ListMuted => json!({"command": "list_muted"}),
        ClientCommand::Forget { aspect, location } => {
            json!({"command": "forget", "aspect": aspect, "location": parse_location(location)?})
        }
        ClientCommand::Mute {
            aspect,
            location,
            duration,
        } => {
            json!({
                "command": "mute",
                "aspect": aspect,
                "location": parse_location(location)?,
                "duration": parse_duration(duration)?,
            })
        }
        ClientCommand::Unmute { aspect, location } => {
            json!({"command": "unmute", "aspect": aspect, "location": parse_location(location)?})
        }
        ClientCommand::ResetFlapping { aspect, location } => {
            json!({"command": "reset_flapping", "aspect": aspect, "location": parse_location(location)?})
        }
        ClientCommand::ResetReminder { aspect, location } => {
            json!({"command": "reset_reminder", "aspect": aspect, "location": parse_location(location)?})
        }
    };

    let reply = control::roundtrip(&socket, &request)
        .await
        .with_context(|| format!("cannot reach hailerter at {}", socket.display()))?;

    if let Some(error) = reply.get("error") {
        eprintln!("{}", json!({"error": error}));
        std::process::exit(1);
    }
    match reply.get("result") {
        Some(Value::Array(rows)) => {
            for row in rows {
                println!("{}", row);
            }
        }
        Some(result) => println!("{}", result),
        None => {}
    }
    Ok(())
}
