//! A card's own deck socket.
//!
//! Each card client listens on `<tmp>/carddeck.XXXXXX/sock` and exports
//! that path to its child as `CARDDECK_SOCKET`, so the child and its
//! descendants can mint sub-cards. Connection `K` (numbered from 0 in
//! accept order) forwards every card it receives upward with its label
//! rewritten to `.K.<label>`, building the hierarchical name one level at
//! a time.
//!
//! ```text
//! child ──connect──► local deck ──► local-deck-K ──pass_card(".K.name.")──► upper deck
//! ```

use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::constants::{MAX_SOCK_PATH, SOCKET_DIR_PREFIX, SOCKET_FILE_NAME};
use crate::naming::forward_label;
use crate::sys;
use crate::transport::{self, Shutdown};

/// Listening socket plus the threads forwarding what arrives on it.
#[derive(Debug)]
pub struct LocalDeck {
    dir: Option<TempDir>,
    path: PathBuf,
    shutdown: Shutdown,
    acceptor: Option<JoinHandle<()>>,
}

impl LocalDeck {
    /// Create the socket and start accepting. Cards are forwarded to
    /// `upper`.
    pub fn start(upper: &UnixStream, poll_interval: Duration) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(SOCKET_DIR_PREFIX)
            .tempdir()
            .context("create local deck directory")?;
        let path = dir.path().join(SOCKET_FILE_NAME);

        let path_len = path.as_os_str().len();
        anyhow::ensure!(
            path_len < MAX_SOCK_PATH,
            "local deck socket path too long ({path_len} bytes, max {}): {}",
            MAX_SOCK_PATH - 1,
            path.display()
        );

        let listener = UnixListener::bind(&path)
            .with_context(|| format!("bind local deck socket {}", path.display()))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .context("restrict local deck socket permissions")?;
        listener
            .set_nonblocking(true)
            .context("set local deck non-blocking")?;

        let upper = Arc::new(Mutex::new(upper.try_clone().context("clone upper-deck stream")?));
        let shutdown = Shutdown::new();
        let acceptor = {
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("local-deck".to_owned())
                .spawn(move || accept_loop(&listener, &upper, &shutdown, poll_interval))
                .context("spawn local deck acceptor")?
        };

        log::info!("[client] local deck listening on {}", path.display());
        Ok(Self {
            dir: Some(dir),
            path,
            shutdown,
            acceptor: Some(acceptor),
        })
    }

    /// Path to export to the child.
    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting and forwarding, then remove the socket directory.
    pub fn stop(mut self) {
        self.halt();
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                log::warn!("[client] failed to remove local deck directory: {e}");
            }
        }
    }

    fn halt(&mut self) {
        self.shutdown.trigger();
        if let Some(handle) = self.acceptor.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LocalDeck {
    fn drop(&mut self) {
        self.halt();
    }
}

fn accept_loop(
    listener: &UnixListener,
    upper: &Arc<Mutex<UnixStream>>,
    shutdown: &Shutdown,
    poll_interval: Duration,
) {
    let fd = listener.as_raw_fd();
    let mut next_index: u64 = 0;
    let mut receivers = Vec::new();

    while !shutdown.is_triggered() {
        let mut fds = [sys::pollfd(fd, libc::POLLIN)];
        match sys::poll(&mut fds, Some(poll_interval)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(e) if sys::is_transient(&e) => continue,
            Err(e) => {
                log::error!("[client] local deck poll failed: {e}");
                break;
            }
        }
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if sys::is_transient(&e) => continue,
            Err(e) => {
                log::warn!("[client] local deck accept failed: {e}");
                thread::sleep(poll_interval);
                continue;
            }
        };

        let index = next_index;
        next_index += 1;
        let upper = Arc::clone(upper);
        let spawned = transport::spawn_receiver(
            format!("local-deck-{index}"),
            stream,
            shutdown.clone(),
            poll_interval,
            move |fd, label| {
                let Some(forwarded) = forward_label(index, &label) else {
                    return;
                };
                let upper = upper.lock().unwrap_or_else(PoisonError::into_inner);
                match transport::pass_card(&upper, fd, &forwarded) {
                    Ok(()) => log::debug!("[client] forwarded card {label:?} as {forwarded:?}"),
                    Err(e) => log::warn!("[client] {e:#}"),
                }
            },
        );
        match spawned {
            Ok(handle) => receivers.push(handle),
            Err(e) => log::error!("[client] failed to start receiver {index}: {e}"),
        }
    }

    for handle in receivers {
        let _ = handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_forwards_with_connection_prefix() {
        let (upper_local, upper_remote) = UnixStream::pair().expect("socketpair");
        let deck = LocalDeck::start(&upper_local, Duration::from_millis(10)).expect("local deck");
        assert!(deck.socket_path().exists());

        let (tx, rx) = mpsc::channel();
        let shutdown = Shutdown::new();
        let receiver = transport::spawn_receiver(
            "test-upper".to_owned(),
            upper_remote,
            shutdown.clone(),
            Duration::from_millis(10),
            move |fd, label| {
                let _ = tx.send((fd, label));
            },
        )
        .expect("spawn receiver");

        let first = UnixStream::connect(deck.socket_path()).expect("connect first");
        let _c0 = transport::mint_card(&first, ".").expect("mint");
        let (_fd, label) = rx.recv_timeout(Duration::from_secs(2)).expect("forwarded");
        assert_eq!(label, ".0.");

        let second = UnixStream::connect(deck.socket_path()).expect("connect second");
        let _c1 = transport::mint_card(&second, ".2.vim.").expect("mint");
        let (_fd, label) = rx.recv_timeout(Duration::from_secs(2)).expect("forwarded");
        assert_eq!(label, ".1.2.vim.");

        let dir = deck.socket_path().parent().map(Path::to_path_buf).expect("dir");
        deck.stop();
        assert!(!dir.exists());

        shutdown.trigger();
        receiver.join().expect("receiver");
    }
}
