//! The shared display/keyboard that cards take turns owning.
//!
//! A [`Device`] is the one resource that needs mutual exclusion across
//! cards. The server guarantees that at most one card owns it at a time and
//! brackets each ownership period with [`Device::claim`] and
//! [`Device::claim_none`]; only the owner calls
//! [`check_ready_for_output`](Device::check_ready_for_output) and
//! [`write`](Device::write).
//!
//! Input flows the other way: the device demultiplexes what the user types
//! to a card and reports it through the registered [`InputCallback`]. A
//! [`DeviceInput::Failed`] event means the device is gone for good and no
//! further input will arrive.
//!
//! Implementations:
//! - [`tty::TtyDevice`]: plain terminal; brackets other cards' output with
//!   text markers.

pub mod tty;

use std::io;
use std::os::unix::io::RawFd;

use bytes::Bytes;

use crate::naming::CardId;

/// One input event from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceInput {
    /// Bytes typed for a card.
    Data(Bytes),
    /// The device failed permanently.
    Failed,
}

/// Receives demultiplexed input. Called from the device's own input thread.
pub type InputCallback = Box<dyn Fn(DeviceInput, &CardId) + Send + Sync>;

/// Answer to "would a write block right now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputReadiness {
    /// Writing will not block; no need to poll.
    Ready,
    /// Unknown; poll this descriptor for `POLLOUT` first.
    Poll(RawFd),
}

/// Capability interface of a display/input device.
pub trait Device: Send + Sync {
    /// Register where demultiplexed input goes. Replaces any previous
    /// callback.
    fn set_input_callback(&self, callback: InputCallback);

    /// Further output belongs to `card`.
    fn claim(&self, card: &CardId);

    /// Further output belongs to no card.
    fn claim_none(&self);

    /// Whether a write would currently block.
    fn check_ready_for_output(&self) -> OutputReadiness;

    /// Write output for the current owner. May be partial; a non-blocking
    /// device returns `WouldBlock` instead of blocking.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Release the device and restore whatever state it changed.
    fn destroy(&self);
}
