//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::EnvFilter;

/// Initialize tracing with the default configuration.
///
/// `RUST_LOG` overrides the default `info` level.
pub fn initialize_tracing() {
    // Don't include timestamps and such because they're not really useful and
    // too verbose, and plus the provisioning agent that runs us already
    // includes timestamps in its own log.
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Log to stderr by default
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();
}
