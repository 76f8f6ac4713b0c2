//! Card client: run one command in a new pty and connect it to a deck.
//!
//! ```text
//! upper deck ◄══ root card socket ══► copy loop ◄══► pty master ◄══► child
//!     ▲                                                                │
//!     └──── local deck (CARDDECK_SOCKET) ◄──── sub-cards minted by ────┘
//!                                              the child's descendants
//! ```
//!
//! [`CardClient::run`] mints the root card, starts the [`LocalDeck`],
//! spawns the child on a fresh pty, pumps bytes until the child exits or
//! either side hangs up, and returns the child's exit status. Errors before
//! the child starts are returned so the caller can fall back to running the
//! command directly; after that every problem is logged and the run ends
//! normally.

pub mod copy;
pub mod local_deck;
pub mod pty;

pub use copy::{copy_loop, CopyEnd};
pub use local_deck::LocalDeck;
pub use pty::Pty;

use std::ffi::{OsStr, OsString};
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::constants::{EXIT_CANNOT_EXECUTE, EXIT_NOT_FOUND, SOCKET_ENV_ERROR, SOCKET_ENV_VAR};
use crate::naming::ROOT_LABEL;
use crate::sys;
use crate::transport;
use crate::tty::{StdioTty, TtySettings};

/// Everything needed to run one command as a card.
#[derive(Debug)]
pub struct CardClient {
    upper: UnixStream,
    stdio: StdioTty,
    settings: TtySettings,
    poll_interval: Duration,
}

impl CardClient {
    /// A client that will mint its card on `upper`.
    pub fn new(
        upper: UnixStream,
        stdio: StdioTty,
        settings: TtySettings,
        poll_interval: Duration,
    ) -> Self {
        Self {
            upper,
            stdio,
            settings,
            poll_interval,
        }
    }

    /// Run `argv` as a card and return its exit status.
    pub fn run(self, argv: &[OsString]) -> Result<i32> {
        let (program, args) = argv.split_first().context("empty command")?;

        let mut root = transport::mint_card(&self.upper, ROOT_LABEL).context("mint root card")?;

        let local_deck = match LocalDeck::start(&self.upper, self.poll_interval) {
            Ok(deck) => Some(deck),
            Err(e) => {
                log::warn!("[client] no local deck, sub-cards disabled: {e:#}");
                None
            }
        };
        let local_deck = scopeguard::guard(local_deck, |deck| {
            if let Some(deck) = deck {
                deck.stop();
            }
        });
        let socket_value: &OsStr = match (*local_deck).as_ref() {
            Some(deck) => deck.socket_path().as_os_str(),
            None => OsStr::new(SOCKET_ENV_ERROR),
        };

        let pty = Pty::open(&self.settings)?;
        let (master, pid) = match pty.spawn(program, args, &self.stdio, &[(SOCKET_ENV_VAR, socket_value)]) {
            Ok(spawned) => spawned,
            Err(e) => {
                let code = if e.kind() == io::ErrorKind::NotFound {
                    EXIT_NOT_FOUND
                } else {
                    EXIT_CANNOT_EXECUTE
                };
                log::warn!("[client] cannot execute {}: {e}", program.to_string_lossy());
                let _ = write!(root, "carddeck: {}: {e}\r\n", program.to_string_lossy());
                return Ok(code);
            }
        };
        log::info!("[client] started {:?} as pid {pid}", program);

        let (exit_notify, watcher) = watch_exit(pid);
        let end = copy_loop(
            root.as_raw_fd(),
            master.as_raw_fd(),
            exit_notify.as_ref().map(AsRawFd::as_raw_fd),
        );
        match &end {
            CopyEnd::Error(e) => log::error!("[client] copy loop failed: {e}"),
            other => log::debug!("[client] copy loop ended: {other:?}"),
        }

        drop(local_deck);
        drop(root);
        // Closing the master hangs up the child if it is still running.
        drop(master);
        drop(exit_notify);

        let status = match watcher {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("exit watcher panicked"))),
            None => pty::wait_for_exit(pid),
        };
        let code = status.unwrap_or_else(|e| {
            log::error!("[client] failed to collect exit status of pid {pid}: {e}");
            EXIT_CANNOT_EXECUTE
        });
        log::info!("[client] pid {pid} exited with {code}");
        Ok(code)
    }
}

/// Start a thread that reaps `pid` and then closes the returned pipe's
/// write end. `(None, None)` means the exit must be collected inline.
fn watch_exit(pid: libc::pid_t) -> (Option<OwnedFd>, Option<thread::JoinHandle<io::Result<i32>>>) {
    let (notify_read, notify_write) = match sys::pipe() {
        Ok(pair) => pair,
        Err(e) => {
            log::warn!("[client] no exit notification pipe: {e}");
            return (None, None);
        }
    };
    let spawned = thread::Builder::new()
        .name(format!("wait-{pid}"))
        .spawn(move || {
            let status = pty::wait_for_exit(pid);
            drop(notify_write);
            status
        });
    match spawned {
        Ok(handle) => (Some(notify_read), Some(handle)),
        Err(e) => {
            log::warn!("[client] no exit watcher thread: {e}");
            (None, None)
        }
    }
}
