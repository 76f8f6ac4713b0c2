//! Pseudo-terminal allocation and child spawning.

use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::ptr;

use anyhow::{Context, Result};

use crate::sys;
use crate::tty::{StdioTty, TtySettings};

/// A freshly opened pty pair.
#[derive(Debug)]
pub struct Pty {
    master: OwnedFd,
    slave: OwnedFd,
}

impl Pty {
    /// Open a pty initialised with `settings`. Both ends are close-on-exec;
    /// the child gets the secondary side through its standard streams.
    pub fn open(settings: &TtySettings) -> Result<Self> {
        let mut termios = settings.termios;
        let mut winsize = settings.winsize;
        let termp = termios.as_mut().map_or(ptr::null_mut(), |t| t as *mut libc::termios);
        let winp = winsize.as_mut().map_or(ptr::null_mut(), |w| w as *mut libc::winsize);

        let mut master: RawFd = -1;
        let mut slave: RawFd = -1;
        // SAFETY: the out-pointers are valid; `termp`/`winp` are null or
        // point at local copies that outlive the call.
        let rc = unsafe { libc::openpty(&mut master, &mut slave, ptr::null_mut(), termp, winp) };
        if rc < 0 {
            return Err(io::Error::last_os_error()).context("openpty");
        }
        // SAFETY: openpty returned two new descriptors owned by nobody else.
        let (master, slave) = unsafe { (OwnedFd::from_raw_fd(master), OwnedFd::from_raw_fd(slave)) };
        sys::set_cloexec(master.as_raw_fd()).context("pty master close-on-exec")?;
        sys::set_cloexec(slave.as_raw_fd()).context("pty secondary close-on-exec")?;
        Ok(Self { master, slave })
    }

    /// Run `program` on the secondary side: it replaces whichever standard
    /// streams `stdio` reports as terminals, the child starts a new session,
    /// and the pty becomes its controlling terminal. `env` is added to the
    /// inherited environment.
    ///
    /// Consumes the secondary side: once the child holds it, the parent must
    /// not, or the master never sees hang-up.
    pub fn spawn(
        self,
        program: &OsStr,
        args: &[OsString],
        stdio: &StdioTty,
        env: &[(&str, &OsStr)],
    ) -> io::Result<(OwnedFd, libc::pid_t)> {
        let Self { master, slave } = self;
        let child = {
            let mut cmd = Command::new(program);
            cmd.args(args);
            for (key, value) in env {
                cmd.env(key, value);
            }
            for fd in stdio.tty_backed() {
                let stream = Stdio::from(slave.try_clone()?);
                match fd {
                    0 => cmd.stdin(stream),
                    1 => cmd.stdout(stream),
                    _ => cmd.stderr(stream),
                };
            }

            let slave_fd = slave.as_raw_fd();
            // SAFETY: the hook only makes async-signal-safe syscalls. The
            // secondary descriptor is close-on-exec but still open here.
            unsafe {
                cmd.pre_exec(move || {
                    if libc::setsid() < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
            cmd.spawn()?
        };
        drop(slave);
        Ok((master, child.id() as libc::pid_t))
    }
}

/// Wait for `pid` to terminate. Returns its exit code, or `128 + signal`
/// if a signal killed it.
pub fn wait_for_exit(pid: libc::pid_t) -> io::Result<i32> {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: `status` is a valid out-pointer.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if libc::WIFEXITED(status) {
            return Ok(libc::WEXITSTATUS(status));
        }
        if libc::WIFSIGNALED(status) {
            return Ok(128 + libc::WTERMSIG(status));
        }
    }
}
