//! Application-wide constants for carddeck.
//!
//! Centralizes fixed sizes, environment variable names and the default
//! arbitration thresholds. The thresholds are only defaults; the values
//! actually used come from [`crate::config::FairnessConfig`].
//!
//! # Categories
//!
//! - **Arbitration**: device ownership hold times and fair-share amount
//! - **Buffers**: per-direction copy buffer sizes
//! - **Transport**: socket naming and environment plumbing
//! - **Exit codes**: process exit statuses of the `deck`/`launcher` binaries

use std::time::Duration;

// ============================================================================
// Arbitration
// ============================================================================

/// Give up the device this long after the last successful write, no matter
/// what. Releasing it lets the device close any "card is active" bracket.
pub const DEFAULT_MAX_HOLD: Duration = Duration::from_millis(500);

/// Shortened hold window once another card has asked for the device while
/// we still have a backlog.
pub const DEFAULT_SHORT_HOLD: Duration = Duration::from_millis(10);

/// Once this many bytes have been written since gaining ownership, a
/// pending claim from another card makes us relinquish immediately.
pub const DEFAULT_FAIR_SHARE_BYTES: usize = 50;

/// Upper bound on a single readiness wait.
///
/// Every worker re-checks the shared shutdown flag at least this often.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long server shutdown waits for the current owner to hand the device
/// back before destroying it anyway.
pub const OWNER_RELEASE_GRACE: Duration = Duration::from_secs(2);

// ============================================================================
// Buffers
// ============================================================================

/// Size of each direction's buffer in the pty ⇄ socket copy loop.
pub const COPY_BUFFER_SIZE: usize = 4096;

/// Size of the device-direction worker's read buffer.
pub const STUB_BUFFER_SIZE: usize = 4096;

/// Largest label accepted in a single transport message.
pub const MAX_LABEL_LEN: usize = 4096;

// ============================================================================
// Transport
// ============================================================================

/// Environment variable naming the local deck socket a child may connect to.
pub const SOCKET_ENV_VAR: &str = "CARDDECK_SOCKET";

/// Placeholder exported when the local deck could not be created.
pub const SOCKET_ENV_ERROR: &str = "(error)";

/// Maximum path length for a Unix domain socket (macOS kernel limit).
pub const MAX_SOCK_PATH: usize = 104;

/// Prefix of the per-card temporary directory holding the deck socket.
pub const SOCKET_DIR_PREFIX: &str = "carddeck.";

/// File name of the deck socket inside its temporary directory.
pub const SOCKET_FILE_NAME: &str = "sock";

// ============================================================================
// Exit codes
// ============================================================================

/// Command line could not be parsed.
pub const EXIT_USAGE: i32 = 3;

/// Setup failed and the fallback exec failed too.
pub const EXIT_SETUP_FAILURE: i32 = 1;

/// The command was found but could not be executed.
pub const EXIT_CANNOT_EXECUTE: i32 = 126;

/// The command was not found.
pub const EXIT_NOT_FOUND: i32 = 127;
