//! daemonshepherd binary
//!
//! Supervisor mode runs the controller loop over a daemons spec file.
//! Client mode sends one command to a running supervisor's control socket
//! and renders the reply.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use daemonshepherd::controller::Controller;
use daemonshepherd::logging::{self, LogDestination};
use daemonshepherd::pid_file::PidFile;
use daemonshepherd::self_detach;
use daemonshepherd::setguid::setguid;
use daemonshepherd::control;

#[derive(Debug, Parser)]
#[command(
    name = "daemonshepherd",
    about = "Start and supervise a declared set of daemons"
)]
struct Cli {
    /// Daemons spec file (YAML); required in supervisor mode
    #[arg(long, value_name = "FILE")]
    daemons: Option<PathBuf>,

    /// Control socket path
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Pid file to claim
    #[arg(long = "pid-file", value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Detach from the terminal and run in the background
    #[arg(long)]
    background: bool,

    /// Run as this user (supervisor-level privilege drop)
    #[arg(long, value_name = "USER")]
    user: Option<String>,

    /// Run as this group
    #[arg(long, value_name = "GROUP")]
    group: Option<String>,

    /// Logging config file (YAML: output, file, level)
    #[arg(long, value_name = "FILE")]
    logging: Option<PathBuf>,

    /// Log to stderr (the default)
    #[arg(long, conflicts_with_all = ["logging", "syslog", "silent"])]
    stderr: bool,

    /// Log to syslog
    #[arg(long, conflicts_with_all = ["logging", "silent"])]
    syslog: bool,

    /// Disable logging altogether
    #[arg(long, conflicts_with = "logging")]
    silent: bool,

    #[command(subcommand)]
    command: Option<ClientCommand>,
}

#[derive(Debug, Subcommand)]
enum ClientCommand {
    /// Reload the daemons spec file
    Reload,
    /// List daemons with pid, running flag and pending restart time
    List,
    /// Start a stopped daemon
    Start { daemon: String },
    /// Stop a running daemon
    Stop { daemon: String },
    /// Stop and immediately start a daemon
    Restart { daemon: String },
    /// Abort a pending restart, leaving the daemon stopped
    CancelRestart { daemon: String },
    /// List a daemon's administrative commands
    ListCommands { daemon: String },
    /// Run an administrative command
    Command { daemon: String, command: String },
}

fn main() -> anyhow::Result<()> {
    let mut cli = Cli::parse();
    match cli.command.take() {
        Some(command) => client_main(cli, command),
        None => supervisor_main(cli),
    }
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

fn supervisor_main(cli: Cli) -> anyhow::Result<()> {
    let spec_path = cli
        .daemons
        .clone()
        .context("supervisor mode requires --daemons FILE")?;

    let (destination, level) = if cli.silent {
        (LogDestination::Silent, None)
    } else if cli.syslog {
        (LogDestination::Syslog, None)
    } else if let Some(ref config) = cli.logging {
        logging::load_config(config)?
    } else {
        (LogDestination::Stderr, None)
    };
    logging::init(&destination, level.as_deref(), "daemonshepherd")?;
    install_panic_hook();

    // fork before the runtime exists; the parent lingers in detach() until
    // setup below succeeds or fails
    let detach_handle = if cli.background {
        Some(self_detach::detach()?)
    } else {
        None
    };

    let _pid_file = match cli.pid_file {
        Some(ref path) => Some(PidFile::claim(path)?),
        None => None,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let mut controller = Controller::new(&spec_path, cli.socket.as_deref())?;
        setguid(cli.user.as_deref(), cli.group.as_deref())?;
        if let Some(handle) = detach_handle {
            handle.detach_succeeded();
        }
        controller.run().await?;
        Ok(())
    })
}

fn client_main(cli: Cli, command: ClientCommand) -> anyhow::Result<()> {
    let socket = cli
        .socket
        .context("client mode requires --socket PATH")?;

    let request = match &command {
        ClientCommand::Reload => json!({"command": "reload"}),
        ClientCommand::List => json!({"command": "list"}),
        ClientCommand::Start { daemon } => json!({"command": "start", "daemon": daemon}),
        ClientCommand::Stop { daemon } => json!({"command": "stop", "daemon": daemon}),
        ClientCommand::Restart { daemon } => json!({"command": "restart", "daemon": daemon}),
        ClientCommand::CancelRestart { daemon } => {
            json!({"command": "cancel_restart", "daemon": daemon})
        }
        ClientCommand::ListCommands { daemon } => {
            json!({"command": "list-commands", "daemon": daemon})
        }
        ClientCommand::Command { daemon, command } => {
            json!({"command": "admin_command", "daemon": daemon, "admin_command": command})
        }
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let reply = runtime
        .block_on(control::roundtrip(&socket, &request))
        .with_context(|| format!("cannot reach supervisor at {}", socket.display()))?;

    if reply.get("status").and_then(Value::as_str) != Some("ok") {
        eprintln!("{}", reply);
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
