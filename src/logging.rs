//! Subscriber setup for the binaries. The library only emits `tracing` events.

use tracing_subscriber::EnvFilter;

/// Log to stderr, filtered by `RUST_LOG` when set, else `info` (`debug` when verbose).
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
