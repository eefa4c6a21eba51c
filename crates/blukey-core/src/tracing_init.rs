//! Shared tracing/logging initialization.
//!
//! Binaries embedding the client and the integration tests use the
//! same `tracing_subscriber` env-filter bootstrap.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// `default_filter` is the `RUST_LOG` value used when the env-var is
/// not set (e.g. `"blukey=debug"`). Safe to call at most once per
/// process; later calls are ignored so tests can race it freely.
pub fn init_tracing(default_filter: &str) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
