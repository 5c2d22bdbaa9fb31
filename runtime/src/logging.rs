//! Log subscriber installation.
//!
//! The runtime logs through `tracing`; these helpers install a formatted,
//! timestamped subscriber gated by the `SLASH_LOG` environment variable
//! (standard `EnvFilter` syntax, default `info`). Call once near process
//! start; later calls are ignored so library consumers that bring their own
//! subscriber keep it.

use std::path::Path;

use tracing_subscriber::EnvFilter;

fn filter() -> EnvFilter {
    EnvFilter::try_from_env("SLASH_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs a stdout subscriber.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_target(true)
        .try_init();
}

/// Installs a subscriber appending to the given file.
///
/// Falls back to stdout if the file cannot be opened.
pub fn init_with_file(path: &Path) {
    match std::fs::OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_target(true)
                .with_ansi(false)
                .with_writer(file)
                .try_init();
        }
        Err(_) => init(),
    }
}
