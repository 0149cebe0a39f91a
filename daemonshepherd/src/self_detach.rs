//! Self-detaching
//! `--background` forks before the async runtime exists. The parent
//! blocks on a pipe until the child has finished setting up, so spec or
//! bind errors still produce a non-zero exit in the invoking shell.

use std::os::fd::RawFd;

use crate::error::Result;

/// Child-side handle for confirming a successful start to the waiting
/// parent. Dropping it unconfirmed makes the parent exit 1.
pub struct DetachHandle {
    confirm_fd: RawFd,
}

/// Fork into the background.
///
/// Returns in the child only. The parent stays in this function reading
/// the confirmation pipe and exits with 0 when
/// [`DetachHandle::detach_succeeded`] is called, 1 otherwise.
pub fn detach() -> Result<DetachHandle> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    if pid > 0 {
        // parent: wait for the child's verdict, then leave
        unsafe { libc::close(write_fd) };
        let mut byte = 0u8;
        let n = unsafe { libc::read(read_fd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
        let code = if n == 1 && byte == b'+' { 0 } else { 1 };
        std::process::exit(code);
    }

    // child: own session, keep the write end for the confirmation
    unsafe {
        libc::close(read_fd);
        libc::setsid();
    }
    Ok(DetachHandle { confirm_fd: write_fd })
}

impl DetachHandle {
    /// Report success to the parent and cut the terminal loose.
    pub fn detach_succeeded(self) {
        unsafe {
            let byte = b'+';
            libc::write(
                self.confirm_fd,
                &byte as *const u8 as *const libc::c_void,
                1,
            );
            libc::close(self.confirm_fd);

            let devnull = libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDWR);
            if devnull >= 0 {
                libc::dup2(devnull, libc::STDIN_FILENO);
                libc::dup2(devnull, libc::STDOUT_FILENO);
                libc::dup2(devnull, libc::STDERR_FILENO);
                if devnull > libc::STDERR_FILENO {
                    libc::close(devnull);
                }
            }
        }
    }
}
