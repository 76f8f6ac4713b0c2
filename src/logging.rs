//! File logging for the binaries.
//!
//! The terminal is the thing being multiplexed, so log output must never go
//! to stdout or stderr. Logs go to `$CARDDECK_LOG_FILE`, or
//! `<tmpdir>/carddeck-<uid>.log` when that is unset.

use std::path::PathBuf;

/// Path of the log file for this user.
pub fn log_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARDDECK_LOG_FILE") {
        return PathBuf::from(path);
    }
    // SAFETY: getuid has no preconditions and cannot fail.
    let uid = unsafe { libc::getuid() };
    std::env::temp_dir().join(format!("carddeck-{uid}.log"))
}

/// Install `env_logger` writing to [`log_path`] plus a panic hook that logs
/// the panic before the default hook runs.
///
/// If the file cannot be opened logging stays disabled; the command still
/// runs.
pub fn init(binary: &str) {
    let path = log_path();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path);
    let Ok(file) = file else {
        return;
    };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(file)))
        .format_timestamp_millis()
        .try_init();

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {:?}", panic_info);
        default_hook(panic_info);
    }));

    log::debug!("[{binary}] logging to {}", path.display());
}
