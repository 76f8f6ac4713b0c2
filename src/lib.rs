//! carddeck - many pty-backed virtual terminals on one physical terminal.
//!
//! A *deck* owns the real terminal. Every command it runs gets its own
//! pseudo-terminal and is connected to the deck as a *card*; commands
//! running inside a card can mint further cards through `$CARDDECK_SOCKET`.
//! All cards share the one display and keyboard through an arbitrated,
//! mutually exclusive ownership protocol.
//!
//! # Architecture
//!
//! ```text
//! child ⇄ pty ⇄ CardClient ⇄ card socket ⇄ CardServer ⇄ stub workers ⇄ Device
//! ```
//!
//! - [`transport`] - descriptor passing used to mint new cards
//! - [`naming`] - flat and hierarchical card identities
//! - [`server`] - registry, device ownership, per-card workers, fairness
//! - [`client`] - pty + child process, copy loop, local deck socket
//! - [`device`] - the shared display/keyboard interface and the plain
//!   terminal implementation
//! - [`cli`] - entry logic for the `deck` and `launcher` binaries
//! - [`config`] - configuration loading

pub mod cli;
pub mod client;
pub mod config;
pub mod constants;
pub mod device;
pub mod logging;
pub mod naming;
pub mod server;
pub mod sys;
pub mod transport;
pub mod tty;

pub use client::CardClient;
pub use config::Config;
pub use device::{Device, DeviceInput};
pub use naming::{CardId, NamingMode};
pub use server::CardServer;
