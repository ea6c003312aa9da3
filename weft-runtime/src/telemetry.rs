//! Tracing initialization
//!
//! Structured logging via `tracing-subscriber` with an env filter. The
//! filter is read from `WEFT_LOG`, falling back to `RUST_LOG`, then `info`.

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber. Safe to call more than once; later
/// calls are no-ops.
pub fn init_tracing() {
    let filter = std::env::var("WEFT_LOG")
        .map(EnvFilter::new)
        .or_else(|_| std::env::var("RUST_LOG").map(EnvFilter::new))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
