//! Card server: the registry of live cards and the device they share.
//!
//! # Architecture
//!
//! ```text
//! upper-deck stream ──► receiver thread ──► new_card(fd, label)
//! listener ──► acceptor thread ──► attach(stream)     │
//!                                                     ▼
//!                       registry: HashMap<CardId, Arc<Card>>
//!                                                     │ stub::spawn
//!                          ┌──────────────────────────┴───────────┐
//!                      stub-dev-<id>                          stub-in-<id>
//!                  claim / give_up ──► Ownership ──► Device ──► dispatch_input
//! ```
//!
//! Three locks, never nested in the order that could deadlock:
//! - the registry mutex guards membership and identity assignment;
//! - the [`Ownership`] mutex guards who owns the device;
//! - each card's queue mutex guards its input FIFO.
//!
//! Input dispatch holds the registry lock while appending to a card's FIFO;
//! nothing ever takes the registry lock while holding a queue lock.
//! Arbitration never touches the registry lock, so cards can come and go
//! while ownership is being handed over.
//!
//! # Shutdown
//!
//! [`CardServer::shutdown`] triggers the shared [`Shutdown`] token, closes
//! ownership (the owner is woken and relinquishes, queued claims fail),
//! destroys the device, and joins every receiver, acceptor and card worker.
//!
//! Rust guideline compliant 2026-02

mod card;
mod fairness;
mod ownership;
mod stub;

pub use card::{Card, CardInput};
pub use fairness::{HoldDecision, Tenure};
pub use ownership::{Ownership, OwnershipState};

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};

use crate::config::Config;
use crate::constants::OWNER_RELEASE_GRACE;
use crate::device::{Device, DeviceInput};
use crate::naming::{CardId, CardPath, NamingMode};
use crate::sys;
use crate::transport::{self, Shutdown};

#[derive(Debug, Default)]
struct Registry {
    cards: HashMap<CardId, Arc<Card>>,
    next_number: u64,
}

/// Multiplexes many cards onto one [`Device`].
pub struct CardServer {
    device: Arc<dyn Device>,
    config: Config,
    registry: Mutex<Registry>,
    ownership: Ownership,
    shutdown: Shutdown,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for CardServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardServer")
            .field("config", &self.config)
            .field("ownership", &self.ownership.state())
            .field("cards", &self.card_count())
            .field("shutdown", &self.shutdown.is_triggered())
            .finish_non_exhaustive()
    }
}

impl CardServer {
    /// Create a server around `device` and register for its input.
    pub fn start(device: Arc<dyn Device>, config: Config) -> Arc<Self> {
        let server = Arc::new(Self {
            device,
            config,
            registry: Mutex::new(Registry::default()),
            ownership: Ownership::new(),
            shutdown: Shutdown::new(),
            workers: Mutex::new(Vec::new()),
        });

        let weak: Weak<Self> = Arc::downgrade(&server);
        server
            .device
            .set_input_callback(Box::new(move |input: DeviceInput, card: &CardId| {
                if let Some(server) = weak.upgrade() {
                    server.dispatch_input(card, input);
                }
            }));

        log::info!(
            "[server] started ({:?} naming, max hold {:?}, short hold {:?}, fair share {} bytes)",
            server.config.naming,
            server.config.fairness.max_hold(),
            server.config.fairness.short_hold(),
            server.config.fairness.fair_share_bytes,
        );
        server
    }

    /// Effective configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `handle` for shutdown, joining workers of cards that have
    /// already finished so the list stays proportional to live cards.
    fn register_worker(&self, handle: JoinHandle<()>) {
        let finished: Vec<_> = {
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            let (finished, running): (Vec<_>, Vec<_>) =
                workers.drain(..).partition(JoinHandle::is_finished);
            *workers = running;
            workers.push(handle);
            finished
        };
        for handle in finished {
            if handle.join().is_err() {
                log::error!("[server] worker thread panicked");
            }
        }
    }

    /// Worker threads started and not yet joined.
    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Receive cards over an already-connected upper-deck stream.
    pub fn attach(self: &Arc<Self>, stream: UnixStream) -> Result<()> {
        anyhow::ensure!(!self.shutdown.is_triggered(), "card server is shutting down");
        let peer = stream.as_raw_fd();
        let weak = Arc::downgrade(self);
        let handle = transport::spawn_receiver(
            format!("deck-recv-{peer}"),
            stream,
            self.shutdown.clone(),
            self.config.poll_interval(),
            move |fd, label| {
                if let Some(server) = weak.upgrade() {
                    server.new_card(fd, &label);
                }
            },
        )
        .context("spawn card receiver")?;
        self.register_worker(handle);
        log::debug!("[server] attached upper-deck stream fd {peer}");
        Ok(())
    }

    /// Accept connections on `listener` and [`attach`](Self::attach) each one.
    pub fn listen(self: &Arc<Self>, listener: UnixListener) -> Result<()> {
        listener
            .set_nonblocking(true)
            .context("set listener non-blocking")?;
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let poll_interval = self.config.poll_interval();
        let handle = thread::Builder::new()
            .name("deck-accept".to_owned())
            .spawn(move || accept_loop(&listener, &weak, &shutdown, poll_interval))
            .context("spawn acceptor thread")?;
        self.register_worker(handle);
        Ok(())
    }

    /// Turn a received descriptor into a live card.
    fn new_card(self: &Arc<Self>, fd: OwnedFd, label: &str) {
        let card = {
            let mut reg = self.registry();
            if self.shutdown.is_triggered() {
                return;
            }
            let id = match self.config.naming {
                NamingMode::Flat => {
                    let n = reg.next_number;
                    reg.next_number += 1;
                    CardId::Number(n)
                }
                NamingMode::Hierarchical => match CardPath::from_wire(label) {
                    Some(path) => CardId::Path(path),
                    None => return,
                },
            };
            if reg.cards.contains_key(&id) {
                log::warn!("[server] card {id} already exists; connection dropped");
                return;
            }
            let card = match Card::new(id.clone(), UnixStream::from(fd)) {
                Ok(card) => Arc::new(card),
                Err(e) => {
                    log::error!("[server] failed to set up card {id}: {e:#}");
                    return;
                }
            };
            reg.cards.insert(id, Arc::clone(&card));
            card
        };

        log::info!("[server] new card {} (label {label:?})", card.id());
        if let Err(e) = stub::spawn(self, Arc::clone(&card)) {
            log::error!("[server] failed to start workers for card {}: {e}", card.id());
            self.deregister(&card);
            card.hang_up();
            card.request_stop();
        }
    }

    /// Block until `card` owns the device, then point the device at it.
    /// Returns `false` if the server is shutting down.
    pub fn claim(&self, card: &Arc<Card>) -> bool {
        if !self.ownership.acquire(card) {
            return false;
        }
        self.device.claim(card.id());
        true
    }

    /// Hand the device back. Only the owner's call has any effect.
    pub fn give_up(&self, card: &Card) {
        if !self.ownership.is_owner(card) {
            return;
        }
        self.device.claim_none();
        self.ownership.release(card);
    }

    /// Route device input to a card's FIFO. Input for an unknown card is
    /// dropped.
    pub fn dispatch_input(&self, card: &CardId, input: DeviceInput) {
        let entry = match input {
            DeviceInput::Data(data) => CardInput::Payload(data),
            DeviceInput::Failed => CardInput::Closed,
        };
        let reg = self.registry();
        match reg.cards.get(card) {
            Some(target) => target.push_input(entry),
            None => {
                drop(reg);
                log::warn!("[server] input for unknown card {card:?}");
            }
        }
    }

    /// Remove `card` from the registry, if it is still the registered card
    /// under its identity.
    fn deregister(&self, card: &Card) {
        let mut reg = self.registry();
        let registered = reg
            .cards
            .get(card.id())
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), card));
        if registered {
            reg.cards.remove(card.id());
            log::info!("[server] card {} closed", card.id());
        }
    }

    /// Number of live cards.
    pub fn card_count(&self) -> usize {
        self.registry().cards.len()
    }

    /// Identities of the live cards, in no particular order.
    pub fn card_ids(&self) -> Vec<CardId> {
        self.registry().cards.keys().cloned().collect()
    }

    /// The card that currently owns the device.
    pub fn owner(&self) -> Option<CardId> {
        self.ownership.owner()
    }

    /// Ownership phase, for diagnostics and tests.
    pub fn ownership_state(&self) -> OwnershipState {
        self.ownership.state()
    }

    /// Whether [`shutdown`](Self::shutdown) has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Force the owner to relinquish, destroy the device, and join every
    /// worker. Must not be called from a server thread.
    pub fn shutdown(&self) {
        if self.shutdown.is_triggered() {
            return;
        }
        log::info!("[server] shutting down with {} cards", self.card_count());
        self.shutdown.trigger();

        if !self.ownership.close(OWNER_RELEASE_GRACE) {
            log::warn!(
                "[server] owner {:?} did not relinquish within {OWNER_RELEASE_GRACE:?}",
                self.ownership.owner()
            );
        }
        self.device.destroy();

        loop {
            let handles: Vec<_> = self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(..)
                .collect();
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if handle.join().is_err() {
                    log::error!("[server] worker thread panicked");
                }
            }
        }
        log::info!("[server] shut down");
    }
}

fn accept_loop(
    listener: &UnixListener,
    server: &Weak<CardServer>,
    shutdown: &Shutdown,
    poll_interval: std::time::Duration,
) {
    let fd = listener.as_raw_fd();
    while !shutdown.is_triggered() {
        let mut fds = [sys::pollfd(fd, libc::POLLIN)];
        match sys::poll(&mut fds, Some(poll_interval)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(e) if sys::is_transient(&e) => continue,
            Err(e) => {
                log::error!("[server] acceptor poll failed: {e}");
                break;
            }
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let Some(server) = server.upgrade() else {
                    break;
                };
                if let Err(e) = server.attach(stream) {
                    log::warn!("[server] {e:#}");
                }
            }
            Err(e) if sys::is_transient(&e) => {}
            Err(e) => {
                log::warn!("[server] accept failed: {e}");
                thread::sleep(poll_interval);
            }
        }
    }
    log::debug!("[server] acceptor stopped");
}
