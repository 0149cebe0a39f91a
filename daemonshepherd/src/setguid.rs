//! Supervisor-level privilege drop
//! Applied once at startup, after the control socket is bound and before
//! any daemon is spawned. Failure is a startup error.

use tracing::info;

use crate::command::{resolve_gid, resolve_uid};
use crate::error::Result;

/// Become the requested user and/or group. Group first, while we are
/// still privileged enough to call setgid.
pub fn setguid(user: Option<&str>, group: Option<&str>) -> Result<()> {
    if let Some(group) = group {
        let gid = resolve_gid(group)?;
        if unsafe { libc::setgid(gid) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        info!(group = %group, gid = gid, "switched group");
    }
    if let Some(user) = user {
        let uid = resolve_uid(user)?;
        if unsafe { libc::setuid(uid) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        info!(user = %user, uid = uid, "switched user");
    }
    Ok(())
}
