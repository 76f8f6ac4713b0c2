//! Per-card shared state.
//!
//! A [`Card`] is shared by exactly two workers (see [`super::stub`]) and,
//! while it is live, by the server registry. It is reference counted, so
//! its socket and notify pipe are closed exactly once, when the last
//! holder lets go, no matter which worker noticed termination first.

use std::collections::VecDeque;
use std::io;
use std::net::Shutdown as NetShutdown;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;

use crate::naming::CardId;
use crate::sys;

/// One entry of a card's input FIFO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardInput {
    /// Bytes to write to the card's socket.
    Payload(Bytes),
    /// The input source is gone; nothing after this is ever written.
    Closed,
}

#[derive(Debug, Default)]
struct InputQueue {
    entries: VecDeque<CardInput>,
    /// Set by the device-direction worker on exit.
    stop: bool,
    /// Set once the socket cannot take more input.
    broken: bool,
}

/// A live virtual terminal.
#[derive(Debug)]
pub struct Card {
    id: CardId,
    socket: UnixStream,
    notify_read: OwnedFd,
    notify_write: OwnedFd,
    input: Mutex<InputQueue>,
    input_cv: Condvar,
}

impl Card {
    /// Wrap an accepted transport socket.
    pub fn new(id: CardId, socket: UnixStream) -> Result<Self> {
        let (notify_read, notify_write) = sys::pipe().context("notify pipe")?;
        sys::set_nonblocking(notify_read.as_raw_fd()).context("notify pipe non-blocking")?;
        sys::set_nonblocking(notify_write.as_raw_fd()).context("notify pipe non-blocking")?;
        socket
            .set_nonblocking(true)
            .context("card socket non-blocking")?;
        Ok(Self {
            id,
            socket,
            notify_read,
            notify_write,
            input: Mutex::new(InputQueue::default()),
            input_cv: Condvar::new(),
        })
    }

    /// This card's identity.
    pub fn id(&self) -> &CardId {
        &self.id
    }

    pub(crate) fn socket_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub(crate) fn notify_fd(&self) -> RawFd {
        self.notify_read.as_raw_fd()
    }

    /// Tell this card someone else wants the device.
    pub fn wake(&self) {
        // A full pipe already carries a pending wake.
        let _ = sys::write(self.notify_write.as_raw_fd(), b"1");
    }

    /// Discard pending wake bytes.
    pub(crate) fn drain_notify(&self) {
        let mut scratch = [0u8; 16];
        while matches!(sys::read(self.notify_read.as_raw_fd(), &mut scratch), Ok(n) if n > 0) {}
    }

    /// Stop both directions of the socket so the peer and the input worker
    /// see hang-up. The descriptor itself closes on drop.
    pub(crate) fn hang_up(&self) {
        let _ = self.socket.shutdown(NetShutdown::Both);
    }

    fn queue(&self) -> MutexGuard<'_, InputQueue> {
        self.input.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append to the input FIFO. Dropped if the card is stopping or broken.
    pub fn push_input(&self, input: CardInput) {
        let mut q = self.queue();
        if q.stop || q.broken {
            return;
        }
        q.entries.push_back(input);
        self.input_cv.notify_one();
    }

    /// Signal the input-direction worker to finish.
    pub(crate) fn request_stop(&self) {
        let mut q = self.queue();
        q.stop = true;
        self.input_cv.notify_all();
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.queue().stop
    }

    /// Block until there is an entry to process. `None` once the card is
    /// stopping or broken.
    pub(crate) fn next_input(&self) -> Option<CardInput> {
        let mut q = self.queue();
        loop {
            if q.stop || q.broken {
                return None;
            }
            if let Some(entry) = q.entries.pop_front() {
                return Some(entry);
            }
            q = self
                .input_cv
                .wait(q)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub(crate) fn mark_broken(&self) {
        self.queue().broken = true;
    }

    /// Wait for the stop signal, then discard whatever is still queued.
    /// Returns the number of discarded entries.
    pub(crate) fn wait_for_stop(&self) -> usize {
        let mut q = self.queue();
        while !q.stop {
            q = self
                .input_cv
                .wait(q)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let discarded = q.entries.len();
        q.entries.clear();
        discarded
    }

    /// Write `data` to the card's socket, polling for writability. Gives up
    /// if the card is told to stop while the socket is full.
    pub(crate) fn write_input(&self, mut data: &[u8], poll_interval: Duration) -> io::Result<()> {
        let fd = self.socket_fd();
        while !data.is_empty() {
            let mut fds = [sys::pollfd(fd, libc::POLLOUT)];
            match sys::poll(&mut fds, Some(poll_interval)) {
                Ok(0) => {
                    if self.stop_requested() {
                        return Err(io::Error::from(io::ErrorKind::BrokenPipe));
                    }
                    continue;
                }
                Ok(_) => {}
                Err(e) if sys::is_transient(&e) => continue,
                Err(e) => return Err(e),
            }
            match sys::write(fd, data) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => data = &data[n..],
                Err(e) if sys::is_transient(&e) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Drop for Card {
    fn drop(&mut self) {
        log::debug!("[stub] card {:?} released", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card() -> (Card, UnixStream) {
        let (ours, peer) = UnixStream::pair().expect("socketpair");
        (Card::new(CardId::Number(1), ours).expect("card"), peer)
    }

    #[test]
    fn test_queue_is_fifo() {
        let (card, _peer) = card();
        card.push_input(CardInput::Payload(Bytes::from_static(b"a")));
        card.push_input(CardInput::Payload(Bytes::from_static(b"b")));
        assert_eq!(card.next_input(), Some(CardInput::Payload(Bytes::from_static(b"a"))));
        assert_eq!(card.next_input(), Some(CardInput::Payload(Bytes::from_static(b"b"))));
    }

    #[test]
    fn test_push_after_stop_is_dropped() {
        let (card, _peer) = card();
        card.request_stop();
        card.push_input(CardInput::Payload(Bytes::from_static(b"late")));
        assert_eq!(card.next_input(), None);
        assert_eq!(card.wait_for_stop(), 0);
    }

    #[test]
    fn test_wait_for_stop_discards_pending() {
        let (card, _peer) = card();
        card.push_input(CardInput::Payload(Bytes::from_static(b"x")));
        card.push_input(CardInput::Closed);
        card.request_stop();
        assert_eq!(card.wait_for_stop(), 2);
    }

    #[test]
    fn test_wake_is_readable_and_drains() {
        let (card, _peer) = card();
        card.wake();
        card.wake();
        let mut fds = [sys::pollfd(card.notify_fd(), libc::POLLIN)];
        assert_eq!(sys::poll(&mut fds, Some(Duration::from_secs(1))).expect("poll"), 1);
        card.drain_notify();
        let mut fds = [sys::pollfd(card.notify_fd(), libc::POLLIN)];
        assert_eq!(sys::poll(&mut fds, Some(Duration::ZERO)).expect("poll"), 0);
    }
}
