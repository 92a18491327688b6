//! Logging bootstrap.
//!
//! Library code never initializes a subscriber itself — only test
//! harnesses and host applications should call [`init`]. Mirrors the
//! reference stack's `tracing` + `tracing-subscriber` + `EnvFilter` setup.

use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber writing to stderr, filtered by
/// `RUST_LOG` (defaulting to `info`). Safe to call more than once; later
/// calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
