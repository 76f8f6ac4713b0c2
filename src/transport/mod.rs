//! Descriptor-passing transport used to mint new cards.
//!
//! # Architecture
//!
//! ```text
//! minting side                               receiving side
//! ────────────                               ──────────────
//! mint_card(upper, "foo.")
//!   socketpair() ─► (ours, theirs)
//!   sendmsg(upper, "foo." + SCM_RIGHTS theirs) ──► receiver thread
//!   return ours                                    recvmsg → (fd, "foo.")
//!                                                  validate label
//!                                                  on_card(fd, "foo.")
//! ```
//!
//! Each message carries exactly one descriptor and one ASCII label ending
//! in `.`. A label that is empty or lacks the terminator (truncated read)
//! gets its descriptor closed silently: no card identity exists yet, so
//! there is nothing to report it against.
//!
//! The receiver is a dedicated thread per connection. It stops on an
//! orderly close (zero-length read), on a persistent socket error, or when
//! the shared [`Shutdown`] token is triggered.
//!
//! Rust guideline compliant 2026-02

pub mod scm;

use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::constants::MAX_LABEL_LEN;
use crate::naming::validate_label;
use crate::sys;

// ─── Shutdown ──────────────────────────────────────────────────────────────

/// Cooperative cancellation token shared by every worker of a server or
/// card client. Workers check it at each readiness-wait boundary.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    /// A fresh, untriggered token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder to stop.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// `true` once [`trigger`](Self::trigger) has been called.
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ─── Minting ───────────────────────────────────────────────────────────────

/// Create a fresh connected pair, hand one end to the upper deck labelled
/// `label`, and return the other end for local use.
pub fn mint_card(upper: &UnixStream, label: &str) -> Result<UnixStream> {
    let (ours, theirs) = UnixStream::pair().context("socketpair for new card")?;
    pass_card(upper, theirs.into(), label)?;
    Ok(ours)
}

/// Send an existing descriptor to the upper deck with `label`, closing our
/// copy afterwards.
pub fn pass_card(upper: &UnixStream, fd: OwnedFd, label: &str) -> Result<()> {
    scm::send_with_fd(upper, label.as_bytes(), fd.as_raw_fd())
        .with_context(|| format!("sendmsg card {label:?} to upper deck"))
}

// ─── Receiving ─────────────────────────────────────────────────────────────

/// Start a receiver thread on an already-connected upper-deck stream.
///
/// `on_card` runs on the receiver thread for every well-formed
/// `(descriptor, label)` pair.
pub fn spawn_receiver<F>(
    name: String,
    stream: UnixStream,
    shutdown: Shutdown,
    poll_interval: Duration,
    on_card: F,
) -> io::Result<thread::JoinHandle<()>>
where
    F: FnMut(OwnedFd, String) + Send + 'static,
{
    thread::Builder::new()
        .name(name)
        .spawn(move || receive_loop(&stream, &shutdown, poll_interval, on_card))
}

/// Receive `(descriptor, label)` messages until the peer closes, a
/// persistent error occurs, or `shutdown` triggers.
pub fn receive_loop<F>(
    stream: &UnixStream,
    shutdown: &Shutdown,
    poll_interval: Duration,
    mut on_card: F,
) where
    F: FnMut(OwnedFd, String),
{
    let sock_fd = stream.as_raw_fd();

    while !shutdown.is_triggered() {
        let mut fds = [sys::pollfd(sock_fd, libc::POLLIN)];
        match sys::poll(&mut fds, Some(poll_interval)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(e) if sys::is_transient(&e) => continue,
            Err(e) => {
                log::warn!("[transport] poll failed: {e}");
                break;
            }
        }

        let (data, mut received) = match scm::recv_with_fds(sock_fd, MAX_LABEL_LEN) {
            Ok((d, f)) if d.is_empty() && f.is_empty() => {
                log::debug!("[transport] upper deck closed");
                break;
            }
            Ok(r) => r,
            Err(e) if sys::is_transient(&e) => continue,
            Err(e) => {
                log::warn!("[transport] recvmsg failed: {e}");
                break;
            }
        };

        if received.is_empty() {
            log::debug!("[transport] message without descriptor ignored");
            continue;
        }
        // One descriptor per message; anything beyond the first is closed.
        received.truncate(1);
        let Some(fd) = received.pop() else {
            continue;
        };

        match parse_label(&data) {
            Some(label) => on_card(fd, label),
            None => drop(fd),
        }
    }
}

/// Decode and validate a wire label.
fn parse_label(data: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(data).ok()?;
    validate_label(text).map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::mpsc;

    fn start(stream: UnixStream, shutdown: &Shutdown) -> (thread::JoinHandle<()>, mpsc::Receiver<(OwnedFd, String)>) {
        let (tx, rx) = mpsc::channel();
        let handle = spawn_receiver(
            "test-receiver".to_owned(),
            stream,
            shutdown.clone(),
            Duration::from_millis(10),
            move |fd, label| {
                let _ = tx.send((fd, label));
            },
        )
        .expect("spawn receiver");
        (handle, rx)
    }

    #[test]
    fn test_minted_card_round_trip() {
        let (upper, server_side) = UnixStream::pair().expect("socketpair");
        let shutdown = Shutdown::new();
        let (handle, rx) = start(server_side, &shutdown);

        let mut ours = mint_card(&upper, "foo.").expect("mint");
        let (fd, label) = rx.recv_timeout(Duration::from_secs(2)).expect("card received");
        assert_eq!(label, "foo.");

        // Usable in both directions.
        let mut theirs = UnixStream::from(fd);
        ours.write_all(b"down").expect("write ours");
        let mut buf = [0u8; 4];
        theirs.read_exact(&mut buf).expect("read theirs");
        assert_eq!(&buf, b"down");
        theirs.write_all(b"up!!").expect("write theirs");
        ours.read_exact(&mut buf).expect("read ours");
        assert_eq!(&buf, b"up!!");

        drop(upper);
        handle.join().expect("receiver exits on close");
    }

    #[test]
    fn test_malformed_labels_are_dropped() {
        let (upper, server_side) = UnixStream::pair().expect("socketpair");
        let shutdown = Shutdown::new();
        let (handle, rx) = start(server_side, &shutdown);

        let unterminated = mint_card(&upper, "foo").expect("mint");
        let _good = mint_card(&upper, "bar.").expect("mint");

        let (_fd, label) = rx.recv_timeout(Duration::from_secs(2)).expect("card received");
        assert_eq!(label, "bar.");

        // The rejected descriptor was closed on the receiving side.
        let mut unterminated = unterminated;
        unterminated
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        let mut buf = [0u8; 1];
        assert_eq!(unterminated.read(&mut buf).expect("eof"), 0);

        drop(upper);
        handle.join().expect("receiver exits");
    }

    #[test]
    fn test_receiver_stops_on_shutdown() {
        let (_upper, server_side) = UnixStream::pair().expect("socketpair");
        let shutdown = Shutdown::new();
        let (handle, _rx) = start(server_side, &shutdown);
        shutdown.trigger();
        handle.join().expect("receiver exits on shutdown");
    }

    #[test]
    fn test_parse_label() {
        assert_eq!(parse_label(b".3.child.").as_deref(), Some(".3.child."));
        assert_eq!(parse_label(b""), None);
        assert_eq!(parse_label(b"abc"), None);
        assert_eq!(parse_label(&[0xff, b'.']), None);
    }
}
