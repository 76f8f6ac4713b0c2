//! Entry logic shared by the `deck` and `launcher` binaries.
//!
//! Both take `command [args...]`. Whatever goes wrong while setting up the
//! multiplexing, the user still gets their command: every setup failure
//! falls back to exec'ing it directly, and only if that fails too does the
//! binary exit with [`EXIT_SETUP_FAILURE`].

use std::ffi::OsString;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::Arc;

use clap::Parser;

use crate::client::CardClient;
use crate::config::Config;
use crate::constants::{EXIT_SETUP_FAILURE, EXIT_USAGE, SOCKET_ENV_ERROR, SOCKET_ENV_VAR};
use crate::device::tty::TtyDevice;
use crate::naming::CardId;
use crate::server::CardServer;
use crate::tty::{StdioTty, TtySettings};

/// `deck command [args...]`
#[derive(Parser, Debug)]
#[command(name = "deck", version)]
#[command(about = "Run a command on a new card deck bound to this terminal")]
#[command(long_about = "Starts the given command under a subordinate pty with a \
card server socket, so that commands in the session can move themselves to \
sub-cards of the main one. The I/O on this terminal becomes a multiplexed \
stream of the I/O of the main card and all of its sub-cards.")]
pub struct DeckCli {
    /// Command to run, followed by its arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<OsString>,
}

/// `launcher command [args...]`
#[derive(Parser, Debug)]
#[command(name = "launcher", version)]
#[command(about = "Run a command in a new card of the enclosing deck")]
#[command(long_about = "Starts the given command in a new card using the \
card server named by $CARDDECK_SOCKET. Without one, the command runs \
directly.")]
pub struct LauncherCli {
    /// Command to run, followed by its arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<OsString>,
}

/// Parse `args`, mapping usage errors to [`EXIT_USAGE`]. Help and version
/// output exit 0.
fn parse<T: Parser>(args: impl IntoIterator<Item = OsString>) -> Result<T, i32> {
    T::try_parse_from(args).map_err(|e| {
        let _ = e.print();
        if e.use_stderr() {
            EXIT_USAGE
        } else {
            0
        }
    })
}

/// Replace this process with `argv`. Returns only if that fails.
pub fn exec_fallback(argv: &[OsString]) -> i32 {
    let Some((program, args)) = argv.split_first() else {
        return EXIT_USAGE;
    };
    let err = Command::new(program).args(args).exec();
    eprintln!("exec {}: {err}", program.to_string_lossy());
    log::error!("[cli] fallback exec of {program:?} failed: {err}");
    EXIT_SETUP_FAILURE
}

/// `deck` entry point.
pub fn deck_main(args: impl IntoIterator<Item = OsString>) -> i32 {
    let cli: DeckCli = match parse(args) {
        Ok(cli) => cli,
        Err(code) => return code,
    };
    run_deck(&cli.command, &Config::load())
}

/// `launcher` entry point.
pub fn launcher_main(args: impl IntoIterator<Item = OsString>) -> i32 {
    let cli: LauncherCli = match parse(args) {
        Ok(cli) => cli,
        Err(code) => return code,
    };
    run_launcher(&cli.command, &Config::load())
}

/// Start a card server on this terminal and run `argv` as its root card.
pub fn run_deck(argv: &[OsString], config: &Config) -> i32 {
    let stdio = StdioTty::detect();
    let Some(tty) = stdio.tty_fd() else {
        eprintln!(
            "This program is designed to run on a tty. \
             Will exec child without doing anything instead."
        );
        return exec_fallback(argv);
    };
    let settings = TtySettings::collect(tty);
    let poll_interval = config.poll_interval();

    let (client_end, server_end) = match UnixStream::pair() {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("socketpair: {e}");
            return exec_fallback(argv);
        }
    };

    let device = match TtyDevice::new(tty, CardId::root(config.naming), poll_interval) {
        Ok(device) => Arc::new(device),
        Err(e) => {
            eprintln!("no terminal device: {e:#}");
            return exec_fallback(argv);
        }
    };
    let server = CardServer::start(device, config.clone());
    if let Err(e) = server.attach(server_end) {
        server.shutdown();
        eprintln!("card server: {e:#}");
        return exec_fallback(argv);
    }

    let status = CardClient::new(client_end, stdio, settings, poll_interval).run(argv);
    server.shutdown();
    match status {
        Ok(code) => code,
        Err(e) => {
            log::error!("[deck] {e:#}");
            eprintln!("{e:#}");
            exec_fallback(argv)
        }
    }
}

/// Run `argv` as a new card of the deck named by `$CARDDECK_SOCKET`.
pub fn run_launcher(argv: &[OsString], config: &Config) -> i32 {
    let socket = std::env::var_os(SOCKET_ENV_VAR)
        .filter(|v| !v.is_empty() && v.as_os_str() != SOCKET_ENV_ERROR);
    let Some(socket) = socket else {
        eprintln!("No ${SOCKET_ENV_VAR}. Will exec child without doing anything instead.");
        return exec_fallback(argv);
    };

    let stdio = StdioTty::detect();
    let Some(tty) = stdio.tty_fd() else {
        eprintln!(
            "This program is designed to run on a tty. \
             Will exec child without doing anything instead."
        );
        return exec_fallback(argv);
    };
    let settings = TtySettings::collect(tty);

    let upper = match UnixStream::connect(&socket) {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("connect to card server {}: {e}", socket.to_string_lossy());
            return exec_fallback(argv);
        }
    };

    match CardClient::new(upper, stdio, settings, config.poll_interval()).run(argv) {
        Ok(code) => code,
        Err(e) => {
            log::error!("[launcher] {e:#}");
            eprintln!("{e:#}");
            exec_fallback(argv)
        }
    }
}
