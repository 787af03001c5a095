//! Diagnostic tracing to stderr.
//!
//! Separate from the product artifacts (session logs, error logs, plan
//! sidecars, mirror files), which are always written regardless of the
//! filter set here.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `level` (e.g. `info`, `relay=debug`).
///
/// # Example
/// ```bash
/// RUST_LOG=relay=debug relay run
/// ```
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
