//! Exclusive device ownership as a ticket-ordered state machine.
//!
//! ```text
//!            acquire(A)                 acquire(B) at head of queue
//!   Free ───────────────► Owned(A) ───────────────────────► TransferPending(A→B)
//!    ▲                       │  release(A)                       │ release(A)
//!    └───────────────────────┘                                   ▼
//!                                                             Owned(B)
//! ```
//!
//! Every claimant draws a ticket and waits until it is served, so claims
//! are granted strictly in arrival order and no claim can overtake one
//! already in flight. The claimant being served wakes the current owner
//! once (through the owner's notify pipe) and then waits for it to release.
//! Possession is installed under the same lock that the next claimant
//! inspects, so a newly granted owner is always recorded before any other
//! claim can proceed.
//!
//! [`Ownership::close`] is the shutdown path: all queued and future claims
//! fail, and the current owner is woken so it can relinquish.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::card::Card;
use crate::naming::CardId;

/// Observable ownership phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnershipState {
    /// Nobody owns the device.
    Free,
    /// `0` owns the device and no claim is in flight.
    Owned(CardId),
    /// `from` owns the device; `to` is the next claimant and is waiting.
    TransferPending {
        /// Current owner.
        from: CardId,
        /// Claimant being served.
        to: CardId,
    },
}

#[derive(Debug, Default)]
struct State {
    owner: Option<Arc<Card>>,
    /// Claimant at the head of the queue, waiting for `owner` to release.
    pending: Option<CardId>,
    next_ticket: u64,
    serving: u64,
    closed: bool,
}

/// The single "who owns the device" slot.
#[derive(Debug, Default)]
pub struct Ownership {
    state: Mutex<State>,
    cv: Condvar,
}

impl Ownership {
    /// A free, open slot.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.cv.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until `card` owns the device. Returns `false` if the slot was
    /// closed first.
    pub fn acquire(&self, card: &Arc<Card>) -> bool {
        let mut st = self.lock();
        if st.closed {
            return false;
        }
        let ticket = st.next_ticket;
        st.next_ticket += 1;

        while st.serving != ticket {
            if st.closed {
                return false;
            }
            st = self.wait(st);
        }

        st.pending = Some(card.id().clone());
        if let Some(owner) = &st.owner {
            owner.wake();
        }
        while st.owner.is_some() && !st.closed {
            st = self.wait(st);
        }
        st.pending = None;
        st.serving += 1;
        if st.closed {
            self.cv.notify_all();
            return false;
        }
        st.owner = Some(Arc::clone(card));
        self.cv.notify_all();
        true
    }

    /// Release ownership held by `card`. Returns `false` (and changes
    /// nothing) if `card` is not the owner.
    pub fn release(&self, card: &Card) -> bool {
        let mut st = self.lock();
        let is_owner = st
            .owner
            .as_ref()
            .is_some_and(|owner| std::ptr::eq(Arc::as_ptr(owner), card));
        if !is_owner {
            return false;
        }
        st.owner = None;
        self.cv.notify_all();
        true
    }

    /// Fail all queued and future claims and ask the owner to relinquish.
    /// Waits up to `grace` for it to do so; returns `true` if the device is
    /// free afterwards.
    pub fn close(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        let mut st = self.lock();
        st.closed = true;
        if let Some(owner) = &st.owner {
            owner.wake();
        }
        self.cv.notify_all();
        while st.owner.is_some() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            st = self
                .cv
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Whether `card` currently owns the device.
    pub fn is_owner(&self, card: &Card) -> bool {
        self.lock()
            .owner
            .as_ref()
            .is_some_and(|owner| std::ptr::eq(Arc::as_ptr(owner), card))
    }

    /// Current owner, if any.
    pub fn owner(&self) -> Option<CardId> {
        self.lock().owner.as_ref().map(|c| c.id().clone())
    }

    /// Snapshot of the phase.
    pub fn state(&self) -> OwnershipState {
        let st = self.lock();
        match (&st.owner, &st.pending) {
            (None, _) => OwnershipState::Free,
            (Some(owner), None) => OwnershipState::Owned(owner.id().clone()),
            (Some(owner), Some(to)) => OwnershipState::TransferPending {
                from: owner.id().clone(),
                to: to.clone(),
            },
        }
    }

    /// Number of claims drawn but not yet granted.
    pub fn queued(&self) -> u64 {
        let st = self.lock();
        st.next_ticket - st.serving
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn card(n: u64) -> (Arc<Card>, UnixStream) {
        let (ours, peer) = UnixStream::pair().expect("socketpair");
        (Arc::new(Card::new(CardId::Number(n), ours).expect("card")), peer)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_acquire_and_release() {
        let own = Ownership::new();
        let (a, _pa) = card(1);
        assert_eq!(own.state(), OwnershipState::Free);
        assert!(own.acquire(&a));
        assert_eq!(own.state(), OwnershipState::Owned(CardId::Number(1)));
        assert!(own.release(&a));
        assert_eq!(own.state(), OwnershipState::Free);
    }

    #[test]
    fn test_release_by_non_owner_is_ignored() {
        let own = Ownership::new();
        let (a, _pa) = card(1);
        let (b, _pb) = card(2);
        assert!(own.acquire(&a));
        assert!(!own.release(&b));
        assert_eq!(own.owner(), Some(CardId::Number(1)));
    }

    #[test]
    fn test_claims_granted_in_arrival_order() {
        let own = Arc::new(Ownership::new());
        let (holder, _ph) = card(0);
        assert!(own.acquire(&holder));

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        let mut peers = Vec::new();
        for n in 1..=4u64 {
            let (c, peer) = card(n);
            peers.push(peer);
            let claimant_own = Arc::clone(&own);
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                assert!(claimant_own.acquire(&c));
                order.lock().expect("order lock").push(n);
                claimant_own.release(&c);
            }));
            // Each claimant must hold its ticket before the next one starts.
            let expected = n;
            wait_until(|| own.queued() == expected);
        }

        assert_eq!(
            own.state(),
            OwnershipState::TransferPending {
                from: CardId::Number(0),
                to: CardId::Number(1),
            }
        );
        own.release(&holder);
        for h in handles {
            h.join().expect("claimant");
        }
        assert_eq!(*order.lock().expect("order lock"), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_never_two_owners() {
        let own = Arc::new(Ownership::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        let mut peers = Vec::new();
        for n in 0..8u64 {
            let (c, peer) = card(n);
            peers.push(peer);
            let own = Arc::clone(&own);
            let inside = Arc::clone(&inside);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    assert!(own.acquire(&c));
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0, "two owners at once");
                    inside.fetch_sub(1, Ordering::SeqCst);
                    assert!(own.release(&c));
                }
            }));
        }
        for h in handles {
            h.join().expect("claimant");
        }
        assert_eq!(own.state(), OwnershipState::Free);
    }

    #[test]
    fn test_pending_claim_wakes_owner() {
        let own = Arc::new(Ownership::new());
        let (a, _pa) = card(1);
        let (b, _pb) = card(2);
        assert!(own.acquire(&a));

        let claimant = {
            let own = Arc::clone(&own);
            let b = Arc::clone(&b);
            thread::spawn(move || own.acquire(&b))
        };

        let mut fds = [crate::sys::pollfd(a.notify_fd(), libc::POLLIN)];
        let ready = crate::sys::poll(&mut fds, Some(Duration::from_secs(5))).expect("poll");
        assert_eq!(ready, 1, "owner was not woken");

        own.release(&a);
        assert!(claimant.join().expect("claimant"));
        assert_eq!(own.owner(), Some(CardId::Number(2)));
    }

    #[test]
    fn test_close_fails_waiting_claims() {
        let own = Arc::new(Ownership::new());
        let (a, _pa) = card(1);
        let (b, _pb) = card(2);
        assert!(own.acquire(&a));

        let claimant = {
            let own = Arc::clone(&own);
            thread::spawn(move || own.acquire(&b))
        };
        wait_until(|| own.queued() == 1);

        let releaser = {
            let own = Arc::clone(&own);
            let a = Arc::clone(&a);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                own.release(&a);
            })
        };
        assert!(own.close(Duration::from_secs(5)));
        releaser.join().expect("releaser");
        assert!(!claimant.join().expect("claimant"));
        assert_eq!(own.state(), OwnershipState::Free);

        let (c, _pc) = card(3);
        assert!(!own.acquire(&c));
    }
}
