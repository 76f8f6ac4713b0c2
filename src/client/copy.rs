//! Byte pump between a card socket and a pty master.
//!
//! Everything on the copy path lives on the stack and uses raw syscalls
//! only. That matters after [`libc::fork`]: the detached helper that takes
//! over once the child has exited runs in a copy of a multi-threaded
//! process, where allocating or taking a lock could deadlock. Callers log
//! the [`CopyEnd`]; nothing in here does.

use std::io;
use std::os::unix::io::RawFd;

use crate::constants::COPY_BUFFER_SIZE;
use crate::sys;

/// Why the copy loop stopped.
#[derive(Debug)]
pub enum CopyEnd {
    /// One side hung up.
    HangUp,
    /// The child exited, and the pty had no other users; all of its output
    /// has been forwarded.
    ChildExited,
    /// The child exited but something else still holds the pty; a forked
    /// helper process carries on copying.
    Detached,
    /// Readiness polling failed.
    Error(io::Error),
}

const HANGUP: libc::c_short = libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;

/// One direction's buffer.
struct Pending {
    data: [u8; COPY_BUFFER_SIZE],
    len: usize,
}

impl Pending {
    const fn new() -> Self {
        Self {
            data: [0; COPY_BUFFER_SIZE],
            len: 0,
        }
    }

    fn has_room(&self) -> bool {
        self.len < self.data.len()
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read more from `fd`. `Ok(0)` is end of stream.
    fn fill_from(&mut self, fd: RawFd) -> io::Result<usize> {
        let n = sys::read(fd, &mut self.data[self.len..])?;
        self.len += n;
        Ok(n)
    }

    /// One write attempt to `fd`.
    fn drain_to(&mut self, fd: RawFd) -> io::Result<()> {
        let n = sys::write(fd, &self.data[..self.len])?;
        self.data.copy_within(n..self.len, 0);
        self.len -= n;
        Ok(())
    }

    /// Best effort: push everything left out to `fd`.
    fn flush_to(&mut self, fd: RawFd) {
        if sys::write_all_polling(fd, &self.data[..self.len]).is_ok() {
            self.len = 0;
        }
    }
}

/// State of a pty ⇄ card copy session.
pub struct Copier {
    to_pty: Pending,
    to_card: Pending,
    child_exited: bool,
}

impl std::fmt::Debug for Copier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Copier")
            .field("to_pty", &self.to_pty.len)
            .field("to_card", &self.to_card.len)
            .field("child_exited", &self.child_exited)
            .finish()
    }
}

impl Default for Copier {
    fn default() -> Self {
        Self::new()
    }
}

impl Copier {
    /// Empty buffers in both directions.
    pub const fn new() -> Self {
        Self {
            to_pty: Pending::new(),
            to_card: Pending::new(),
            child_exited: false,
        }
    }

    /// Copy until one side hangs up.
    ///
    /// `exit_notify` becomes readable (or hangs up) when the child exits.
    /// At that point the copy either keeps going in this process until the
    /// pty drains, or, if other processes still hold the pty, continues in
    /// a forked helper while this call returns [`CopyEnd::Detached`].
    pub fn run(&mut self, card: RawFd, pty: RawFd, mut exit_notify: Option<RawFd>) -> CopyEnd {
        let _ = sys::set_nonblocking(card);
        let _ = sys::set_nonblocking(pty);

        loop {
            let card_events = events(&self.to_pty, &self.to_card);
            let pty_events = events(&self.to_card, &self.to_pty);
            // poll ignores entries with a negative descriptor.
            let mut fds = [
                sys::pollfd(card, card_events),
                sys::pollfd(pty, pty_events),
                sys::pollfd(exit_notify.unwrap_or(-1), libc::POLLIN),
            ];
            match sys::poll(&mut fds, None) {
                Ok(_) => {}
                Err(e) if sys::is_transient(&e) => continue,
                Err(e) => return CopyEnd::Error(e),
            }

            if exit_notify.is_some() && fds[2].revents != 0 {
                exit_notify = None;
                self.child_exited = true;
                if pty_has_other_users(pty) {
                    // SAFETY: the child branch only runs this allocation-free
                    // loop on the inherited stack buffers, then `_exit`s.
                    match unsafe { libc::fork() } {
                        0 => {
                            let _ = self.run(card, pty, None);
                            // SAFETY: terminate the helper without running
                            // the parent's atexit handlers or destructors.
                            unsafe { libc::_exit(0) }
                        }
                        pid if pid > 0 => return CopyEnd::Detached,
                        // No helper: keep copying here instead.
                        _ => {}
                    }
                }
                continue;
            }

            let (card_rev, pty_rev) = (fds[0].revents, fds[1].revents);

            if card_rev & libc::POLLOUT != 0 {
                if let Err(e) = self.to_card.drain_to(card) {
                    if !sys::is_transient(&e) {
                        return CopyEnd::HangUp;
                    }
                }
            }
            if pty_rev & libc::POLLOUT != 0 {
                // A failed write shows up as a hang-up on the read side.
                let _ = self.to_pty.drain_to(pty);
            }

            if card_rev & libc::POLLIN != 0 {
                match self.to_pty.fill_from(card) {
                    Ok(0) => return CopyEnd::HangUp,
                    Ok(_) => {}
                    Err(e) if sys::is_transient(&e) => {}
                    Err(_) => return CopyEnd::HangUp,
                }
            } else if card_rev & HANGUP != 0 {
                return CopyEnd::HangUp;
            }

            let pty_done = if pty_rev & libc::POLLIN != 0 {
                match self.to_card.fill_from(pty) {
                    Ok(0) => true,
                    Ok(_) => false,
                    Err(e) if sys::is_transient(&e) => false,
                    // EIO once the last secondary-side holder is gone.
                    Err(_) => true,
                }
            } else {
                pty_rev & HANGUP != 0
            };
            if pty_done {
                self.to_card.flush_to(card);
                return if self.child_exited {
                    CopyEnd::ChildExited
                } else {
                    CopyEnd::HangUp
                };
            }
        }
    }
}

/// Poll events for a descriptor that fills `inbound` and drains `outbound`.
fn events(inbound: &Pending, outbound: &Pending) -> libc::c_short {
    let mut events = 0;
    if inbound.has_room() {
        events |= libc::POLLIN;
    }
    if !outbound.is_empty() {
        events |= libc::POLLOUT;
    }
    events
}

/// Whether anything besides us still holds the pty's secondary side.
/// The master reports hang-up once the last holder closes it.
fn pty_has_other_users(pty: RawFd) -> bool {
    let mut fds = [sys::pollfd(pty, libc::POLLIN)];
    match sys::poll(&mut fds, Some(std::time::Duration::ZERO)) {
        Ok(_) => fds[0].revents & libc::POLLHUP == 0,
        Err(_) => true,
    }
}

/// Copy between `card` and `pty` until hang-up; see [`Copier::run`].
pub fn copy_loop(card: RawFd, pty: RawFd, exit_notify: Option<RawFd>) -> CopyEnd {
    Copier::new().run(card, pty, exit_notify)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_copies_both_directions_until_hangup() {
        let (card_ours, mut card_peer) = UnixStream::pair().expect("socketpair");
        let (pty_ours, mut pty_peer) = UnixStream::pair().expect("socketpair");

        let pump = thread::spawn(move || {
            let end = copy_loop(card_ours.as_raw_fd(), pty_ours.as_raw_fd(), None);
            drop((card_ours, pty_ours));
            end
        });

        card_peer.write_all(b"typed").expect("write card");
        let mut buf = [0u8; 5];
        pty_peer.read_exact(&mut buf).expect("read pty side");
        assert_eq!(&buf, b"typed");

        pty_peer.write_all(b"shown").expect("write pty");
        card_peer.read_exact(&mut buf).expect("read card side");
        assert_eq!(&buf, b"shown");

        drop(pty_peer);
        assert!(matches!(pump.join().expect("pump"), CopyEnd::HangUp));
    }

    #[test]
    fn test_output_written_before_hangup_is_forwarded() {
        let (card_ours, mut card_peer) = UnixStream::pair().expect("socketpair");
        let (pty_ours, mut pty_peer) = UnixStream::pair().expect("socketpair");

        pty_peer.write_all(b"last words").expect("write");
        drop(pty_peer);

        let end = copy_loop(card_ours.as_raw_fd(), pty_ours.as_raw_fd(), None);
        assert!(matches!(end, CopyEnd::HangUp));
        drop(card_ours);

        card_peer
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        let mut out = Vec::new();
        card_peer.read_to_end(&mut out).expect("read");
        assert_eq!(out, b"last words");
    }
}
