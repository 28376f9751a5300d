#![forbid(unsafe_code)]

//! JSON log output for production deployments.
//!
//! Library code only emits `tracing` events; installing a subscriber is the
//! application's call. This helper installs a JSON formatter filtered by the
//! `OBSKIT_LOG` environment variable (same syntax as `RUST_LOG`).

use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Environment variable holding the log filter directive.
pub const ENV_FILTER: &str = "OBSKIT_LOG";

/// Filter applied when [`ENV_FILTER`] is unset or invalid.
pub const DEFAULT_FILTER: &str = "info";

/// Install a global JSON subscriber.
///
/// Fails if a global subscriber is already set.
pub fn init_json_subscriber() -> Result<()> {
    let filter =
        EnvFilter::try_from_env(ENV_FILTER).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| Error::Logging {
            message: err.to_string(),
        })
}
