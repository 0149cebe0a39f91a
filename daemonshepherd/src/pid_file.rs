//! Pid file handling
//! Claimed exclusively at startup, rewritten after self-detach (the pid
//! changes across the fork), removed on orderly exit.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Create the pid file, refusing to clobber an existing one.
    pub fn claim(path: &Path) -> Result<Self> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|err| Error::PidFile {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        writeln!(file, "{}", std::process::id()).map_err(|err| Error::PidFile {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        Ok(PidFile {
            path: path.to_path_buf(),
        })
    }

    /// Rewrite with the current pid. Needed once after detaching.
    pub fn update(&self) -> Result<()> {
        std::fs::write(&self.path, format!("{}\n", std::process::id())).map_err(|err| {
            Error::PidFile {
                path: self.path.clone(),
                reason: err.to_string(),
            }
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
