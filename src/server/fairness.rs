//! Hold/relinquish policy for the device owner.
//!
//! The owner keeps a [`Tenure`] for the current ownership period and asks
//! it, before every wait, whether to give the device up now or how long it
//! may keep it. Three thresholds from [`FairnessConfig`] drive the answer:
//!
//! | backlog | contended | written            | decision                          |
//! |---------|-----------|--------------------|-----------------------------------|
//! | yes     | yes       | `>= fair_share`    | relinquish now                    |
//! | yes     | yes       | `> 0`              | hold until last write + short     |
//! | yes     | no        | `> 0`              | hold until last write + max       |
//! | yes     | any       | `0`                | hold indefinitely                 |
//! | no      | any       | any                | hold until last write + max       |
//!
//! A card that has not written anything since gaining the device is never
//! forced out by demand or by a timer; it keeps the device until it makes
//! progress.

use std::time::{Duration, Instant};

use crate::config::FairnessConfig;

/// What the owner should do before its next wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldDecision {
    /// Give the device up now.
    Relinquish,
    /// Keep it. `Some(d)`: re-evaluate after at most `d`. `None`: no
    /// deadline applies.
    Hold(Option<Duration>),
}

/// Bookkeeping for one ownership period.
#[derive(Debug, Clone, Copy)]
pub struct Tenure {
    last_write: Instant,
    written: usize,
    contended: bool,
}

impl Tenure {
    /// Start a period at `now`.
    pub fn begin(now: Instant) -> Self {
        Self {
            last_write: now,
            written: 0,
            contended: false,
        }
    }

    /// `n` bytes reached the device at `now`.
    pub fn record_write(&mut self, n: usize, now: Instant) {
        if n > 0 {
            self.written = self.written.saturating_add(n);
            self.last_write = now;
        }
    }

    /// Another card asked for the device.
    pub fn mark_contended(&mut self) {
        self.contended = true;
    }

    /// Bytes written since the period began.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Whether another card has asked for the device during this period.
    pub fn contended(&self) -> bool {
        self.contended
    }

    /// Decide whether to keep the device. `backlog` is whether output is
    /// still waiting to be written.
    pub fn decide(&self, cfg: &FairnessConfig, backlog: bool, now: Instant) -> HoldDecision {
        let mut window = cfg.max_hold();
        if backlog && self.contended {
            if self.written > 0 && self.written >= cfg.fair_share_bytes {
                return HoldDecision::Relinquish;
            }
            window = cfg.short_hold();
        }

        if backlog && self.written == 0 {
            return HoldDecision::Hold(None);
        }

        let deadline = self.last_write + window;
        if now >= deadline {
            HoldDecision::Relinquish
        } else {
            HoldDecision::Hold(Some(deadline - now))
        }
    }
}
