//! Logging setup
//! Initializes the `tracing` subscriber for one of the supported
//! destinations: stderr, syslog, a plain file, or nothing at all.
//! `--logging FILE` points at a small YAML document choosing the
//! destination and level.

use std::ffi::CString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Where log records go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogDestination {
    Stderr,
    Syslog,
    Silent,
    File(PathBuf),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum OutputKind {
    Stderr,
    Syslog,
    File,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LoggingConfig {
    output: OutputKind,
    file: Option<PathBuf>,
    level: Option<String>,
}

/// Read a logging config file into a destination and an optional level.
pub fn load_config(path: &Path) -> Result<(LogDestination, Option<String>)> {
    let contents = std::fs::read_to_string(path).map_err(|source| Error::SpecRead {
        path: path.to_path_buf(),
        source,
    })?;
    let config: LoggingConfig =
        serde_yaml::from_str(&contents).map_err(|source| Error::SpecParse {
            path: path.to_path_buf(),
            source,
        })?;
    let destination = match config.output {
        OutputKind::Stderr => LogDestination::Stderr,
        OutputKind::Syslog => LogDestination::Syslog,
        OutputKind::File => match config.file {
            Some(file) => LogDestination::File(file),
            None => {
                return Err(Error::SpecInvalid {
                    daemon: "logging".to_string(),
                    reason: "output: file requires a file: path".to_string(),
                })
            }
        },
    };
    Ok((destination, config.level))
}

fn env_filter(level: Option<&str>) -> EnvFilter {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(level.unwrap_or("info")),
    }
}

/// Install the global subscriber. Call once, early.
pub fn init(destination: &LogDestination, level: Option<&str>, ident: &'static str) -> Result<()> {
    match destination {
        LogDestination::Stderr => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter(level))
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogDestination::Silent => {
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new("off"))
                .with_writer(std::io::sink)
                .init();
        }
        LogDestination::File(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(env_filter(level))
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(false)
                .init();
        }
        LogDestination::Syslog => {
            syslog_open(ident);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter(level))
                .with_writer(|| SyslogWriter::default())
                .with_ansi(false)
                .with_target(false)
                .without_time()
                .init();
        }
    }
    Ok(())
}

fn syslog_open(ident: &'static str) {
    // the ident pointer must stay valid for the lifetime of the process
    static IDENT: Mutex<Option<CString>> = Mutex::new(None);
    let mut guard = match IDENT.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let cstr = CString::new(ident).unwrap_or_default();
    unsafe {
        libc::openlog(cstr.as_ptr(), libc::LOG_PID, libc::LOG_DAEMON);
    }
    *guard = Some(cstr);
}

/// Line-buffered writer handing every record to syslog at info priority.
#[derive(Default)]
struct SyslogWriter {
    buffer: Vec<u8>,
}

impl Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for SyslogWriter {
    fn drop(&mut self) {
        for line in self.buffer.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            if let Ok(message) = CString::new(line.to_vec()) {
                unsafe {
                    libc::syslog(
                        libc::LOG_INFO,
                        b"%s\0".as_ptr() as *const libc::c_char,
                        message.as_ptr(),
                    );
                }
            }
        }
    }
}
