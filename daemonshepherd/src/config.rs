//! Daemons spec file
//! Parses the YAML document (top-level `defaults` and `daemons`) into
//! resolved per-daemon specs. Resolved specs implement `PartialEq` over
//! every declared field; reload diffing relies on that equality and must
//! not depend on field order in the source YAML.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Backoff schedule used when a daemon declares no `restart` list.
pub const DEFAULT_RESTART: &[u64] = &[0, 5, 15, 30, 60];

/// Start priority used when a daemon declares none. Lower starts earlier.
pub const DEFAULT_START_PRIORITY: i32 = 10;

/// Command names with lifecycle meaning. They may appear under `commands`
/// in the spec file but are not dispatchable through `admin_command`.
pub const RESERVED_COMMANDS: &[&str] = &["stop", "before-start", "after-crash"];

/// A command line as declared: either a shell snippet or an explicit argv.
///
/// A string form is only run through `/bin/sh -c` when it contains shell
/// metacharacters; otherwise it is split on whitespace and executed
/// directly. That resolution happens at spawn time so that equality here
/// stays purely declarative.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandLine {
    /// Human-readable rendering for logs and error messages.
    pub fn display(&self) -> String {
        match self {
            CommandLine::Shell(s) => s.clone(),
            CommandLine::Argv(argv) => argv.join(" "),
        }
    }
}

/// Where a daemon's stdout/stderr goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdoutMode {
    /// Inherit the supervisor's terminal.
    #[default]
    Console,
    /// Discard.
    Devnull,
    /// Capture through a pipe and emit each line via the logger.
    Log,
}

/// Signal as written in the spec file, by name or number.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SignalSpec {
    Number(i32),
    Name(String),
}

impl SignalSpec {
    pub fn resolve(&self) -> Result<i32> {
        match self {
            SignalSpec::Number(n) if *n > 0 => Ok(*n),
            SignalSpec::Number(n) => Err(Error::UnknownSignal(n.to_string())),
            SignalSpec::Name(name) => parse_signal_name(name),
        }
    }
}

/// Accepts `TERM`, `SIGTERM`, `term` and friends.
pub fn parse_signal_name(name: &str) -> Result<i32> {
    let upper = name.to_uppercase();
    let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
    let signo = match bare {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "ILL" => libc::SIGILL,
        "ABRT" => libc::SIGABRT,
        "FPE" => libc::SIGFPE,
        "KILL" => libc::SIGKILL,
        "SEGV" => libc::SIGSEGV,
        "PIPE" => libc::SIGPIPE,
        "ALRM" => libc::SIGALRM,
        "TERM" => libc::SIGTERM,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        "CHLD" => libc::SIGCHLD,
        "CONT" => libc::SIGCONT,
        "STOP" => libc::SIGSTOP,
        "TSTP" => libc::SIGTSTP,
        "WINCH" => libc::SIGWINCH,
        _ => return Err(Error::UnknownSignal(name.to_string())),
    };
    Ok(signo)
}

/// How to bring a child down.
#[derive(Debug, Clone, PartialEq)]
pub enum StopMethod {
    /// Spawn this command and wait for it.
    Command(CommandLine),
    /// Send a signal to the child or to its whole process group.
    Signal { signal: i32, process_group: bool },
}

impl Default for StopMethod {
    fn default() -> Self {
        StopMethod::Signal {
            signal: libc::SIGTERM,
            process_group: true,
        }
    }
}

/// What an administrative command does when invoked.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminAction {
    Command(CommandLine),
    Signal { signal: i32, process_group: bool },
}

/// Resolved administrative command. Fields a sub-spec left out are filled
/// in from the owning daemon at resolution time.
#[derive(Debug, Clone, PartialEq)]
pub struct AdminCommand {
    pub action: AdminAction,
    pub user: Option<String>,
    pub group: Option<Vec<String>>,
    pub cwd: Option<PathBuf>,
    pub environment: Option<BTreeMap<String, String>>,
    pub argv0: Option<String>,
}

/// Fully resolved declaration of one supervised daemon.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonSpec {
    pub name: String,
    pub start_command: CommandLine,
    pub argv0: Option<String>,
    pub stop: StopMethod,
    /// When set, REPLACES the child's environment entirely.
    pub environment: Option<BTreeMap<String, String>>,
    pub cwd: Option<PathBuf>,
    pub user: Option<String>,
    pub group: Option<Vec<String>>,
    pub stdout: StdoutMode,
    /// Tail-repeating backoff schedule, in seconds. Never empty.
    pub restart: Vec<u64>,
    pub start_priority: i32,
    pub commands: BTreeMap<String, AdminCommand>,
}

impl DaemonSpec {
    /// Admin command names dispatchable through the control socket.
    pub fn admin_command_names(&self) -> Vec<String> {
        self.commands
            .keys()
            .filter(|name| !RESERVED_COMMANDS.contains(&name.as_str()))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum GroupSpec {
    One(String),
    Many(Vec<String>),
}

impl GroupSpec {
    fn into_vec(self) -> Vec<String> {
        match self {
            GroupSpec::One(g) => vec![g],
            GroupSpec::Many(gs) => gs,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStop {
    command: Option<CommandLine>,
    signal: Option<SignalSpec>,
    process_group: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAdminCommand {
    command: Option<CommandLine>,
    signal: Option<SignalSpec>,
    process_group: Option<bool>,
    user: Option<String>,
    group: Option<GroupSpec>,
    cwd: Option<PathBuf>,
    environment: Option<BTreeMap<String, String>>,
    argv0: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDaemon {
    start_command: Option<CommandLine>,
    argv0: Option<String>,
    stop: Option<RawStop>,
    environment: Option<BTreeMap<String, String>>,
    cwd: Option<PathBuf>,
    user: Option<String>,
    group: Option<GroupSpec>,
    stdout: Option<StdoutMode>,
    restart: Option<Vec<u64>>,
    start_priority: Option<i32>,
    commands: Option<BTreeMap<String, RawAdminCommand>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SpecFile {
    #[serde(default)]
    defaults: RawDaemon,
    daemons: BTreeMap<String, RawDaemon>,
}

/// Read and resolve the daemons spec file.
pub fn load(path: &Path) -> Result<BTreeMap<String, DaemonSpec>> {
    let contents = std::fs::read_to_string(path).map_err(|source| Error::SpecRead {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&contents, path)
}

/// Parse a spec document. Split out from [`load`] for tests.
pub fn parse(contents: &str, path: &Path) -> Result<BTreeMap<String, DaemonSpec>> {
    let spec: SpecFile = serde_yaml::from_str(contents).map_err(|source| Error::SpecParse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut daemons = BTreeMap::new();
    for (name, raw) in spec.daemons {
        let resolved = resolve_daemon(&name, raw, &spec.defaults)?;
        daemons.insert(name, resolved);
    }
    Ok(daemons)
}

fn resolve_daemon(name: &str, raw: RawDaemon, defaults: &RawDaemon) -> Result<DaemonSpec> {
    // field-wise fallback to the `defaults` section
    let start_command = raw
        .start_command
        .or_else(|| defaults.start_command.clone())
        .ok_or_else(|| Error::SpecInvalid {
            daemon: name.to_string(),
            reason: "missing start_command".to_string(),
        })?;
    let argv0 = raw.argv0.or_else(|| defaults.argv0.clone());
    let environment = raw.environment.or_else(|| defaults.environment.clone());
    let cwd = raw.cwd.or_else(|| defaults.cwd.clone());
    let user = raw.user.or_else(|| defaults.user.clone());
    let group = raw
        .group
        .or_else(|| defaults.group.clone())
        .map(GroupSpec::into_vec);
    let stdout = raw.stdout.or(defaults.stdout).unwrap_or_default();
    let restart = raw
        .restart
        .or_else(|| defaults.restart.clone())
        .unwrap_or_else(|| DEFAULT_RESTART.to_vec());
    if restart.is_empty() {
        return Err(Error::SpecInvalid {
            daemon: name.to_string(),
            reason: "restart list must not be empty".to_string(),
        });
    }
    let start_priority = raw
        .start_priority
        .or(defaults.start_priority)
        .unwrap_or(DEFAULT_START_PRIORITY);

    let raw_commands = raw
        .commands
        .or_else(|| defaults.commands.clone())
        .unwrap_or_default();

    let mut commands = BTreeMap::new();
    for (cmd_name, raw_cmd) in &raw_commands {
        let resolved = resolve_admin_command(
            name,
            cmd_name,
            raw_cmd,
            user.as_deref(),
            group.as_deref(),
            cwd.as_deref(),
            environment.as_ref(),
            argv0.as_deref(),
        )?;
        commands.insert(cmd_name.clone(), resolved);
    }

    // stop precedence: commands.stop, then the `stop` field, then SIGTERM
    // to the process group
    let stop = if let Some(stop_cmd) = commands.remove("stop") {
        match stop_cmd.action {
            AdminAction::Command(cmd) => StopMethod::Command(cmd),
            AdminAction::Signal {
                signal,
                process_group,
            } => StopMethod::Signal {
                signal,
                process_group,
            },
        }
    } else {
        resolve_stop(name, raw.stop.or_else(|| defaults.stop.clone()))?
    };

    Ok(DaemonSpec {
        name: name.to_string(),
        start_command,
        argv0,
        stop,
        environment,
        cwd,
        user,
        group,
        stdout,
        restart,
        start_priority,
        commands,
    })
}

fn resolve_stop(name: &str, raw: Option<RawStop>) -> Result<StopMethod> {
    let raw = match raw {
        Some(raw) => raw,
        None => return Ok(StopMethod::default()),
    };
    // within the `stop` field itself, `command` wins over `signal`
    if let Some(cmd) = raw.command {
        return Ok(StopMethod::Command(cmd));
    }
    match raw.signal {
        Some(signal) => Ok(StopMethod::Signal {
            signal: signal.resolve()?,
            process_group: raw.process_group.unwrap_or(false),
        }),
        None => {
            if raw.process_group.is_some() {
                return Err(Error::SpecInvalid {
                    daemon: name.to_string(),
                    reason: "stop.process_group given without stop.signal".to_string(),
                });
            }
            Ok(StopMethod::default())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn resolve_admin_command(
    daemon: &str,
    cmd_name: &str,
    raw: &RawAdminCommand,
    user: Option<&str>,
    group: Option<&[String]>,
    cwd: Option<&Path>,
    environment: Option<&BTreeMap<String, String>>,
    argv0: Option<&str>,
) -> Result<AdminCommand> {
    let action = match (&raw.command, &raw.signal) {
        // as with `stop`, a command wins over a signal
        (Some(cmd), _) => AdminAction::Command(cmd.clone()),
        (None, Some(signal)) => AdminAction::Signal {
            signal: signal.resolve()?,
            process_group: raw.process_group.unwrap_or(false),
        },
        (None, None) => {
            return Err(Error::SpecInvalid {
                daemon: daemon.to_string(),
                reason: format!("command '{}' declares neither command nor signal", cmd_name),
            })
        }
    };

    Ok(AdminCommand {
        action,
        user: raw.user.clone().or_else(|| user.map(str::to_string)),
        group: raw
            .group
            .clone()
            .map(GroupSpec::into_vec)
            .or_else(|| group.map(<[String]>::to_vec)),
        cwd: raw.cwd.clone().or_else(|| cwd.map(Path::to_path_buf)),
        environment: raw.environment.clone().or_else(|| environment.cloned()),
        argv0: raw.argv0.clone().or_else(|| argv0.map(str::to_string)),
    })
}
