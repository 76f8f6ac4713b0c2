//! `deck`: multiplex this terminal between a command and the cards it mints.

use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() {
    carddeck::logging::init("deck");
    let code = carddeck::cli::deck_main(std::env::args_os());
    log::info!("[deck] exiting with {code}");
    std::process::exit(code);
}
