//! Logging initialization.

use tracing_subscriber::EnvFilter;

/// Log to stderr so command output on stdout stays machine-readable.
///
/// `RUST_LOG` overrides the default filter.
pub fn init_logging(verbose: bool) {
    let default = if verbose {
        "tether=debug,tether_mcp=debug,tether_auth=debug"
    } else {
        "tether=info,tether_mcp=warn,tether_auth=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
