//! Logging initialization.
//!
//! Progress lines go to stderr through `tracing`; verbosity is controlled
//! by `--debug` or the `ELEMENTAL_LOG` environment variable.

use tracing_subscriber::EnvFilter;

pub fn init(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("ELEMENTAL_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
