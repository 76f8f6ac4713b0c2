//! Which standard streams are terminals, and what they look like.

use std::os::unix::io::RawFd;

/// Terminal-ness of fds 0, 1 and 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdioTty {
    /// `is_tty[i]` is true when fd `i` is a terminal.
    pub is_tty: [bool; 3],
}

impl StdioTty {
    /// Probe the current process's standard streams.
    pub fn detect() -> Self {
        let mut is_tty = [false; 3];
        for (fd, slot) in is_tty.iter_mut().enumerate() {
            // SAFETY: isatty only inspects the descriptor.
            *slot = unsafe { libc::isatty(fd as RawFd) } == 1;
        }
        Self { is_tty }
    }

    /// The first standard stream that is a terminal.
    pub fn tty_fd(&self) -> Option<RawFd> {
        self.is_tty.iter().position(|&t| t).map(|i| i as RawFd)
    }

    /// Standard streams a new pty should replace in the child.
    pub fn tty_backed(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.is_tty
            .iter()
            .enumerate()
            .filter(|(_, t)| **t)
            .map(|(i, _)| i as RawFd)
    }
}

/// Snapshot used to initialise a new pty like the terminal we run on.
#[derive(Clone, Copy, Default)]
pub struct TtySettings {
    /// Terminal attributes, if the descriptor had any.
    pub termios: Option<libc::termios>,
    /// Window size, if the descriptor reported one.
    pub winsize: Option<libc::winsize>,
}

impl std::fmt::Debug for TtySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtySettings")
            .field("termios", &self.termios.is_some())
            .field(
                "winsize",
                &self.winsize.map(|w| (w.ws_row, w.ws_col)),
            )
            .finish()
    }
}

impl TtySettings {
    /// Read attributes and window size from `fd`. Either may be missing.
    pub fn collect(fd: RawFd) -> Self {
        // SAFETY: termios is plain old data and only used if tcgetattr
        // succeeds.
        let mut termios: libc::termios = unsafe { std::mem::zeroed() };
        // SAFETY: `termios` is a valid, writable struct.
        let termios = (unsafe { libc::tcgetattr(fd, &mut termios) } == 0).then_some(termios);

        let mut winsize = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCGWINSZ writes a winsize struct into the pointer.
        let winsize =
            (unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut winsize) } == 0).then_some(winsize);

        Self { termios, winsize }
    }
}
