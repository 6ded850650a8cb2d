//! Subscriber setup for binaries and tests.
//!
//! The library itself only emits `tracing` events and never installs a
//! subscriber; that is the embedding application's call. [`try_init`]
//! covers the common case without taking the choice away: it filters by
//! `RUST_LOG` (default: info) and writes human-readable output, or
//! flattened JSON when `LOG_FORMAT=json` is set for log aggregation.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Install the default subscriber for this process.
///
/// Returns false when a subscriber is already set — an embedding
/// application that configured its own, or a second test in the same
/// process — instead of panicking like `init` would.
pub fn try_init() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    if json {
        builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_events(FmtSpan::CLOSE)
            .try_init()
            .is_ok()
    } else {
        builder.with_ansi(true).try_init().is_ok()
    }
}
