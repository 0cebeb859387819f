//! Tracing subscriber setup for hosts and tests.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! the host application's call. These helpers wire up the common case: a
//! format layer filtered through `RUST_LOG`, defaulting to `info`.

use tracing_subscriber::EnvFilter;

/// Install the default subscriber, ignoring failure if one is already set.
///
/// Safe to call from every test; only the first call wins.
pub fn init() {
    let _ = try_init();
}

/// Install the default subscriber, reporting failure if one is already set
pub fn try_init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()?;
    Ok(())
}
