//! Tracing subscriber setup.

use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, prelude::*};

use crate::settings::{LogFormat, LogSettings};

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured filter. Fails if a global
/// subscriber is already set or the filter does not parse.
pub fn init(settings: &LogSettings) -> Result<(), tower::BoxError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&settings.filter)?,
    };

    let (plain, json) = match settings.format {
        LogFormat::Plain => (Some(tracing_subscriber::fmt::layer().with_target(false)), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };

    tracing_subscriber::registry()
        .with(plain)
        .with(json)
        .with(filter)
        .with(ErrorLayer::default())
        .try_init()?;
    Ok(())
}
