//! `launcher`: run a command in a new card of the enclosing deck.

use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() {
    carddeck::logging::init("launcher");
    let code = carddeck::cli::launcher_main(std::env::args_os());
    log::info!("[launcher] exiting with {code}");
    std::process::exit(code);
}
