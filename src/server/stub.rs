//! The per-card worker pair.
//!
//! ```text
//!                 ┌───────────── stub-dev-<id> ─────────────┐
//! card socket ──► │ read buffer ─► claim ─► fairness ─► write │ ──► Device
//!                 └──────────────────────────────────────────┘
//!                 ┌───────────── stub-in-<id> ──────────────┐
//! card socket ◄── │ write_input ◄──────── FIFO ◄──── dispatch │ ◄── Device input
//!                 └──────────────────────────────────────────┘
//! ```
//!
//! The device-direction worker owns the card's lifecycle: when the card's
//! socket hangs up with nothing left to write, or the device fails, it gives
//! the device back, removes the card from the registry, hangs up the socket
//! and tells its partner to stop. The input-direction worker drains the FIFO
//! until the card is broken or stopping, then waits for that stop signal
//! before discarding what is left. Both hold an `Arc<Card>`; whichever drops
//! last closes the descriptors.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::card::{Card, CardInput};
use super::fairness::{HoldDecision, Tenure};
use super::CardServer;
use crate::constants::STUB_BUFFER_SIZE;
use crate::device::OutputReadiness;
use crate::sys;

const HANGUP: libc::c_short = libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;

/// Start both workers for `card`. Their handles are registered with the
/// server so shutdown can join them.
pub(super) fn spawn(server: &Arc<CardServer>, card: Arc<Card>) -> io::Result<()> {
    let device_worker = {
        let server = Arc::clone(server);
        let card = Arc::clone(&card);
        thread::Builder::new()
            .name(format!("stub-dev-{}", card.id()))
            .spawn(move || device_loop(&server, card))?
    };
    server.register_worker(device_worker);

    let poll_interval = server.config.poll_interval();
    let input_worker = {
        let card = Arc::clone(&card);
        thread::Builder::new()
            .name(format!("stub-in-{}", card.id()))
            .spawn(move || input_loop(card, poll_interval))
    };
    match input_worker {
        Ok(handle) => {
            server.register_worker(handle);
            Ok(())
        }
        Err(e) => {
            // Nobody will consume input; the device worker still tears the
            // card down when its socket closes.
            card.mark_broken();
            Err(e)
        }
    }
}

/// Card socket → device.
fn device_loop(server: &CardServer, card: Arc<Card>) {
    let fairness = server.config.fairness;
    let poll_interval = server.config.poll_interval();
    let device = Arc::clone(&server.device);
    let sock_fd = card.socket_fd();

    let mut buf = vec![0u8; STUB_BUFFER_SIZE];
    let mut fill = 0usize;
    let mut tenure: Option<Tenure> = None;
    let mut card_open = true;

    log::debug!("[stub] card {} started", card.id());

    loop {
        if server.shutdown.is_triggered() {
            break;
        }
        if tenure.is_none() && fill > 0 {
            // Wakes left over from an earlier ownership period are stale.
            card.drain_notify();
            if !server.claim(&card) {
                break;
            }
            tenure = Some(Tenure::begin(Instant::now()));
        }
        if !card_open && fill == 0 {
            break;
        }

        let mut timeout = poll_interval;
        if let Some(t) = &tenure {
            match t.decide(&fairness, fill > 0, Instant::now()) {
                HoldDecision::Relinquish => {
                    log::trace!("[stub] card {} relinquishes after {} bytes", card.id(), t.written());
                    server.give_up(&card);
                    tenure = None;
                    continue;
                }
                HoldDecision::Hold(Some(d)) => timeout = timeout.min(d),
                HoldDecision::Hold(None) => {}
            }
        }

        let mut fds = [sys::pollfd(card.notify_fd(), libc::POLLIN); 3];
        let mut nfds = 1;
        let mut device_slot = None;
        let mut sock_slot = None;
        let mut try_write = false;

        if fill > 0 && tenure.is_some() {
            match device.check_ready_for_output() {
                OutputReadiness::Ready => {
                    try_write = true;
                    timeout = Duration::ZERO;
                }
                OutputReadiness::Poll(fd) => {
                    fds[nfds] = sys::pollfd(fd, libc::POLLOUT);
                    device_slot = Some(nfds);
                    nfds += 1;
                }
            }
        }
        if card_open && fill < buf.len() {
            fds[nfds] = sys::pollfd(sock_fd, libc::POLLIN);
            sock_slot = Some(nfds);
            nfds += 1;
        }

        match sys::poll(&mut fds[..nfds], Some(timeout)) {
            Ok(_) => {}
            Err(e) if sys::is_transient(&e) => continue,
            Err(e) => {
                log::error!("[stub] card {} poll failed: {e}", card.id());
                break;
            }
        }

        if fds[0].revents != 0 {
            if let Some(t) = tenure.as_mut() {
                t.mark_contended();
            }
            card.drain_notify();
        }

        if let Some(i) = sock_slot {
            let revents = fds[i].revents;
            if revents & libc::POLLIN != 0 {
                match sys::read(sock_fd, &mut buf[fill..]) {
                    Ok(0) => card_open = false,
                    Ok(n) => fill += n,
                    Err(e) if sys::is_transient(&e) => {}
                    Err(e) => {
                        log::debug!("[stub] card {} read failed: {e}", card.id());
                        card_open = false;
                    }
                }
            } else if revents & HANGUP != 0 {
                card_open = false;
            }
        }

        if let Some(i) = device_slot {
            let revents = fds[i].revents;
            if revents & HANGUP != 0 {
                log::info!("[stub] device hung up while card {} was writing", card.id());
                break;
            }
            if revents & libc::POLLOUT != 0 {
                try_write = true;
            }
        }

        if try_write {
            match device.write(&buf[..fill]) {
                Ok(n) => {
                    buf.copy_within(n..fill, 0);
                    fill -= n;
                    if let Some(t) = tenure.as_mut() {
                        t.record_write(n, Instant::now());
                    }
                }
                Err(e) if sys::is_transient(&e) => {}
                Err(e) => {
                    log::warn!("[stub] write to device failed for card {}: {e}", card.id());
                    break;
                }
            }
        }
    }

    if tenure.is_some() {
        server.give_up(&card);
    }
    server.deregister(&card);
    card.hang_up();
    card.request_stop();
    log::debug!("[stub] card {} device side finished", card.id());
}

/// Device input FIFO → card socket.
fn input_loop(card: Arc<Card>, poll_interval: Duration) {
    while let Some(entry) = card.next_input() {
        match entry {
            CardInput::Payload(data) => {
                if let Err(e) = card.write_input(&data, poll_interval) {
                    log::debug!("[stub] input to card {} failed: {e}", card.id());
                    card.mark_broken();
                }
            }
            CardInput::Closed => card.mark_broken(),
        }
    }

    let discarded = card.wait_for_stop();
    if discarded > 0 {
        log::debug!("[stub] card {} discarded {discarded} pending input chunks", card.id());
    }
}
