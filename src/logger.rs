//! Global `tracing` subscriber setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer};

/// Install the stdout logger.
///
/// Events at INFO and above are printed unless `RUST_LOG` selects
/// otherwise, e.g. `RUST_LOG=certboot=debug,tower_http=debug`.
pub fn try_init() -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_level(true)
        .with_target(true)
        .with_filter(filter);
    tracing_subscriber::registry().with(stdout_log).try_init()
}
