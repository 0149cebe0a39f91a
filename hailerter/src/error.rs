//! Errors that can take the program down. Per-line input problems are
//! not errors; malformed messages are dropped where they are read.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot bind control socket '{}': {source}", path.display())]
    SocketBind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("invalid fraction '{0}'")]
    InvalidFraction(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
