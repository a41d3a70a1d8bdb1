//! Process-wide structured logging setup: `tracing` + `tracing-subscriber`
//! for leveled, structured logs, with `tracing-error`'s
//! [`tracing_error::ErrorLayer`] wired in so a captured
//! [`tracing_error::SpanTrace`] can ride alongside an
//! [`crate::errors::OrchestratorError`] and survive across `?`.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the process-wide subscriber. Reads `RUST_LOG`, defaulting to
/// `info`. Idempotent: a second call (e.g. from multiple test binaries)
/// simply fails `try_init` silently rather than panicking.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_error::ErrorLayer::default())
        .try_init();
}
