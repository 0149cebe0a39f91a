//! Supervisor errors
//! Configuration problems are fatal at startup; everything else is
//! recorded and survived.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot read spec file '{}': {source}", path.display())]
    SpecRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed spec file '{}': {source}", path.display())]
    SpecParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("daemon '{daemon}': {reason}")]
    SpecInvalid { daemon: String, reason: String },

    #[error("unknown user '{0}'")]
    UnknownUser(String),

    #[error("unknown group '{0}'")]
    UnknownGroup(String),

    #[error("unknown signal '{0}'")]
    UnknownSignal(String),

    #[error("unknown daemon '{0}'")]
    UnknownDaemon(String),

    #[error("daemon '{daemon}' has no command '{command}'")]
    UnknownCommand { daemon: String, command: String },

    #[error("daemon '{daemon}' is already running")]
    AlreadyRunning { daemon: String },

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("command failed with exit code {status}")]
    CommandFailed { status: i32 },

    #[error("cannot bind control socket '{}': {source}", path.display())]
    SocketBind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("pid file '{}': {reason}", path.display())]
    PidFile { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
