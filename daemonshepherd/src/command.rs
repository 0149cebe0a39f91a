//! Command resolution and process construction
//! Turns a declared command line plus its run context (environment, cwd,
//! credentials, argv0) into a ready-to-spawn `tokio::process::Command`.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;

use tracing::warn;

use crate::config::CommandLine;
use crate::error::{Error, Result};

/// Characters that force a string command through `/bin/sh -c`.
const SHELL_META: &[u8] = b"]'\"$&*()`{}\\;<>?[";

fn has_shell_meta(command: &str) -> bool {
    command.bytes().any(|b| SHELL_META.contains(&b))
}

/// Resolve a declared command line into an argv vector.
///
/// A string containing shell metacharacters becomes `/bin/sh -c <string>`;
/// a plain string is split on whitespace; an explicit argv list is taken
/// as-is.
pub fn resolve_argv(line: &CommandLine) -> Result<Vec<String>> {
    let argv = match line {
        CommandLine::Shell(s) if has_shell_meta(s) => {
            vec!["/bin/sh".to_string(), "-c".to_string(), s.clone()]
        }
        CommandLine::Shell(s) => s.split_whitespace().map(str::to_string).collect(),
        CommandLine::Argv(argv) => argv.clone(),
    };
    if argv.is_empty() || argv[0].is_empty() {
        return Err(Error::Spawn {
            command: line.display(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        });
    }
    Ok(argv)
}

/// Resolve a user name (or numeric id) to a uid.
pub fn resolve_uid(user: &str) -> Result<libc::uid_t> {
    if let Ok(uid) = user.parse::<libc::uid_t>() {
        return Ok(uid);
    }
    let name = CString::new(user).map_err(|_| Error::UnknownUser(user.to_string()))?;
    // getpwnam is fine here: credential resolution happens before spawn,
    // never in the child
    let pwd = unsafe { libc::getpwnam(name.as_ptr()) };
    if pwd.is_null() {
        return Err(Error::UnknownUser(user.to_string()));
    }
    Ok(unsafe { (*pwd).pw_uid })
}

/// Resolve a group name (or numeric id) to a gid.
pub fn resolve_gid(group: &str) -> Result<libc::gid_t> {
    if let Ok(gid) = group.parse::<libc::gid_t>() {
        return Ok(gid);
    }
    let name = CString::new(group).map_err(|_| Error::UnknownGroup(group.to_string()))?;
    let grp = unsafe { libc::getgrnam(name.as_ptr()) };
    if grp.is_null() {
        return Err(Error::UnknownGroup(group.to_string()));
    }
    Ok(unsafe { (*grp).gr_gid })
}

/// Run context shared by start commands, stop commands and administrative
/// commands.
#[derive(Debug, Default)]
pub struct ExecContext<'a> {
    pub argv0: Option<&'a str>,
    /// When set, replaces the child environment wholesale.
    pub environment: Option<&'a BTreeMap<String, String>>,
    /// Extra variables layered on top of whatever environment the child
    /// gets (`DAEMON_PID` and friends).
    pub extra_env: Vec<(String, String)>,
    pub cwd: Option<&'a Path>,
    pub user: Option<&'a str>,
    pub group: Option<&'a [String]>,
}

/// Build a spawnable command.
///
/// The child is detached into its own session (`setsid`), gets its stdin
/// from `/dev/null`, and drops to the requested credentials when the
/// supervisor itself is privileged. Stdout/stderr dispositions are left to
/// the caller.
pub fn prepare(line: &CommandLine, ctx: &ExecContext<'_>) -> Result<tokio::process::Command> {
    let argv = resolve_argv(line)?;

    let mut cmd = std::process::Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.stdin(Stdio::null());

    if let Some(argv0) = ctx.argv0 {
        cmd.arg0(argv0);
    }
    if let Some(dir) = ctx.cwd {
        cmd.current_dir(dir);
    }
    if let Some(env) = ctx.environment {
        cmd.env_clear();
        cmd.envs(env);
    }
    for (key, value) in &ctx.extra_env {
        cmd.env(key, value);
    }

    // Credentials only make sense when we are root; otherwise setuid would
    // fail the spawn outright.
    let privileged = unsafe { libc::geteuid() } == 0;
    let uid = match ctx.user {
        Some(user) if privileged => Some(resolve_uid(user)?),
        Some(user) => {
            warn!(user = %user, "not running as root, ignoring requested user");
            None
        }
        None => None,
    };
    let gids = match ctx.group {
        Some(groups) if privileged => {
            let mut gids = Vec::with_capacity(groups.len());
            for group in groups {
                gids.push(resolve_gid(group)?);
            }
            Some(gids)
        }
        Some(_) => None,
        None => None,
    };

    unsafe {
        cmd.pre_exec(move || {
            // own session and process group, so ^C at the supervisor's
            // terminal does not reach the children and a whole shell
            // pipeline can be signalled at once
            if libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if let Some(ref gids) = gids {
                if libc::setgroups(gids.len(), gids.as_ptr()) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::setgid(gids[0]) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            if let Some(uid) = uid {
                if libc::setuid(uid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    Ok(tokio::process::Command::from(cmd))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_string_splits_on_whitespace() {
        let line = CommandLine::Shell("/usr/bin/env  FOO=1".to_string());
        assert_eq!(
            resolve_argv(&line).unwrap(),
            vec!["/usr/bin/env", "FOO=1"]
        );
    }

    #[test]
    fn metacharacters_go_through_shell() {
        let line = CommandLine::Shell("echo hello > /tmp/out".to_string());
        assert_eq!(
            resolve_argv(&line).unwrap(),
            vec!["/bin/sh", "-c", "echo hello > /tmp/out"]
        );
    }

    #[test]
    fn pipeline_goes_through_shell() {
        let line = CommandLine::Shell("sleep 10; echo done".to_string());
        assert_eq!(resolve_argv(&line).unwrap()[0], "/bin/sh");
    }

    #[test]
    fn argv_list_taken_verbatim() {
        let line = CommandLine::Argv(vec!["echo".to_string(), "a b".to_string()]);
        assert_eq!(resolve_argv(&line).unwrap(), vec!["echo", "a b"]);
    }

    #[test]
    fn empty_command_rejected() {
        assert!(resolve_argv(&CommandLine::Shell(String::new())).is_err());
        assert!(resolve_argv(&CommandLine::Argv(vec![])).is_err());
    }

    #[test]
    fn numeric_user_and_group_resolve_without_lookup() {
        assert_eq!(resolve_uid("0").unwrap(), 0);
        assert_eq!(resolve_gid("0").unwrap(), 0);
    }
}
