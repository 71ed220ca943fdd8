//! Tracing setup for binaries embedding the engine.
//!
//! The library itself only emits `tracing` events; nothing is printed until
//! a subscriber is installed.

use std::sync::Once;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding the filter directives, e.g. `conductor=debug`
pub const LOG_ENV: &str = "CONDUCTOR_LOG";

const DEFAULT_FILTER: &str = "info";

static INIT: Once = Once::new();

/// Install a stderr subscriber filtered by `CONDUCTOR_LOG`, defaulting to `info`.
/// Only the first call in a process has any effect.
pub fn init() {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    install(filter);
}

/// Same as [`init`] with explicit directives, ignoring the environment
pub fn init_with_filter(directives: &str) {
    install(EnvFilter::new(directives));
}

fn install(filter: EnvFilter) {
    INIT.call_once(|| {
        // Another subscriber may already be installed by the host application
        let _ = fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .try_init();
    });
}
