//! Plain-terminal device.
//!
//! The simplest possible [`Device`]: all keyboard input goes to the root
//! card, and output from any other card is bracketed so the user can tell
//! the streams apart:
//!
//! ```text
//! root card output...
//! From card 0.1 {{{ output of card 0.1 }}}
//! root card output...
//! ```
//!
//! The terminal is switched to raw mode (echo off) for the lifetime of the
//! device; [`Device::destroy`] restores the saved attributes and file
//! status flags.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;

use super::{Device, DeviceInput, InputCallback, OutputReadiness};
use crate::naming::CardId;
use crate::sys;
use crate::transport::Shutdown;

/// Marker closing a non-root card's output.
const CLOSE_BRACKET: &[u8] = b"}}}\n";

type SharedCallback = Arc<RwLock<Option<InputCallback>>>;

/// Terminal device driving one tty descriptor it does not own.
pub struct TtyDevice {
    fd: RawFd,
    root: CardId,
    active: Mutex<Option<CardId>>,
    callback: SharedCallback,
    saved_termios: Option<libc::termios>,
    saved_flags: Option<libc::c_int>,
    shutdown: Shutdown,
    input_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for TtyDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtyDevice")
            .field("fd", &self.fd)
            .field("root", &self.root)
            .field("raw_mode", &self.saved_termios.is_some())
            .finish_non_exhaustive()
    }
}

impl TtyDevice {
    /// Take over the terminal on `fd`: raw mode, non-blocking, and an input
    /// thread delivering everything typed to `root`.
    pub fn new(fd: RawFd, root: CardId, poll_interval: Duration) -> Result<Self> {
        // SAFETY: F_GETFL only reads descriptor flags.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        let saved_flags = (flags >= 0).then_some(flags);
        sys::set_nonblocking(fd).context("set tty non-blocking")?;

        let saved_termios = enter_raw_mode(fd);
        if saved_termios.is_none() {
            log::warn!("[tty] fd {fd} has no termios; input stays cooked");
        }

        let callback: SharedCallback = Arc::new(RwLock::new(None));
        let shutdown = Shutdown::new();
        let input_thread = {
            let callback = Arc::clone(&callback);
            let shutdown = shutdown.clone();
            let root = root.clone();
            thread::Builder::new()
                .name("tty-input".to_owned())
                .spawn(move || input_loop(fd, &root, &callback, &shutdown, poll_interval))
                .context("spawn tty input thread")?
        };

        Ok(Self {
            fd,
            root,
            active: Mutex::new(None),
            callback,
            saved_termios,
            saved_flags,
            shutdown,
            input_thread: Mutex::new(Some(input_thread)),
        })
    }

    fn write_marker(&self, marker: &[u8]) {
        if let Err(e) = sys::write_all_polling(self.fd, marker) {
            log::warn!("[tty] failed to write card marker: {e}");
        }
    }
}

impl Device for TtyDevice {
    fn set_input_callback(&self, callback: InputCallback) {
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    fn claim(&self, card: &CardId) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.as_ref() == Some(card) {
            return;
        }
        if !card.is_root() {
            self.write_marker(format!("From card {card} {{{{{{").as_bytes());
        }
        *active = Some(card.clone());
    }

    fn claim_none(&self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(card) = active.take() {
            if !card.is_root() {
                self.write_marker(CLOSE_BRACKET);
            }
        }
    }

    fn check_ready_for_output(&self) -> OutputReadiness {
        OutputReadiness::Poll(self.fd)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        sys::write(self.fd, buf)
    }

    fn destroy(&self) {
        self.shutdown.trigger();
        let handle = self
            .input_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        let _ = handle.join();

        if let Some(termios) = self.saved_termios {
            // SAFETY: restoring attributes previously read from this fd.
            unsafe { libc::tcsetattr(self.fd, libc::TCSANOW, &termios) };
        }
        if let Some(flags) = self.saved_flags {
            // SAFETY: restoring flags previously read from this fd.
            unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags) };
        }
        log::debug!("[tty] device released, root card {:?}", self.root);
    }
}

/// Switch `fd` to raw mode with echo off. Returns the previous attributes.
fn enter_raw_mode(fd: RawFd) -> Option<libc::termios> {
    // SAFETY: termios is plain old data; tcgetattr fills it on success.
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };
    // SAFETY: `tio` is a valid, writable termios struct.
    if unsafe { libc::tcgetattr(fd, &mut tio) } != 0 {
        return None;
    }
    let saved = tio;
    // SAFETY: `tio` was initialized by tcgetattr above.
    unsafe {
        libc::cfmakeraw(&mut tio);
        tio.c_lflag &= !libc::ECHO;
        libc::tcsetattr(fd, libc::TCSANOW, &tio);
    }
    Some(saved)
}

/// Read the terminal until it hangs up, handing everything to the root card.
fn input_loop(
    fd: RawFd,
    root: &CardId,
    callback: &SharedCallback,
    shutdown: &Shutdown,
    poll_interval: Duration,
) {
    let mut buf = [0u8; 4096];

    while !shutdown.is_triggered() {
        let mut fds = [sys::pollfd(fd, libc::POLLIN)];
        match sys::poll(&mut fds, Some(poll_interval)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(e) if sys::is_transient(&e) => continue,
            Err(e) => {
                log::error!("[tty] poll failed: {e}");
                break;
            }
        }
        if fds[0].revents & libc::POLLIN == 0 && fds[0].revents & libc::POLLHUP != 0 {
            log::info!("[tty] terminal hung up");
            break;
        }
        match sys::read(fd, &mut buf) {
            Ok(0) => {
                log::info!("[tty] terminal EOF");
                break;
            }
            Ok(n) => deliver(callback, DeviceInput::Data(Bytes::copy_from_slice(&buf[..n])), root),
            Err(e) if sys::is_transient(&e) => continue,
            Err(e) => {
                log::error!("[tty] read failed: {e}");
                break;
            }
        }
    }

    if !shutdown.is_triggered() {
        deliver(callback, DeviceInput::Failed, root);
    }
}

fn deliver(callback: &SharedCallback, input: DeviceInput, card: &CardId) {
    let guard = callback.read().unwrap_or_else(PoisonError::into_inner);
    match guard.as_ref() {
        Some(cb) => cb(input, card),
        None => log::debug!("[tty] input before callback registration dropped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::{CardPath, NamingMode};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc;

    fn device_on_socket() -> (TtyDevice, UnixStream, UnixStream) {
        let (ours, theirs) = UnixStream::pair().expect("socketpair");
        let device = TtyDevice::new(
            ours.as_raw_fd(),
            CardId::root(NamingMode::Hierarchical),
            Duration::from_millis(10),
        )
        .expect("tty device");
        (device, ours, theirs)
    }

    fn read_available(stream: &mut UnixStream) -> Vec<u8> {
        use std::io::Read;
        stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .expect("timeout");
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        while let Ok(n) = stream.read(&mut buf) {
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn test_non_root_output_is_bracketed() {
        let (device, _ours, mut theirs) = device_on_socket();
        let child = CardId::Path(CardPath::from_wire(".0.1.").expect("label"));

        device.claim(&CardId::root(NamingMode::Hierarchical));
        device.write(b"root ").expect("write");
        device.claim_none();
        device.claim(&child);
        device.write(b"child").expect("write");
        device.claim_none();

        assert_eq!(read_available(&mut theirs), b"root From card 0.1 {{{child}}}\n");
        device.destroy();
    }

    #[test]
    fn test_input_goes_to_root_and_hangup_reports_failure() {
        use std::io::Write;
        let (device, _ours, mut theirs) = device_on_socket();
        let (tx, rx) = mpsc::channel();
        device.set_input_callback(Box::new(move |input: DeviceInput, card: &CardId| {
            let _ = tx.send((input, card.clone()));
        }));

        theirs.write_all(b"ls\r").expect("type");
        let (input, card) = rx.recv_timeout(Duration::from_secs(2)).expect("input");
        assert_eq!(input, DeviceInput::Data(Bytes::from_static(b"ls\r")));
        assert!(card.is_root());

        drop(theirs);
        let (input, _) = rx.recv_timeout(Duration::from_secs(2)).expect("failure event");
        assert_eq!(input, DeviceInput::Failed);
        device.destroy();
    }
}
