// Logging module for structured logging using the tracing crate

use std::error::Error;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Build the event filter: RUST_LOG when set, otherwise the configured level
fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, Box<dyn Error + Send + Sync>> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(&config.level)?),
    }
}

/// Initialize the tracing subscriber for structured logging
///
/// Output goes to stderr, as plain text or JSON lines depending on
/// `config.json`.
///
/// # Errors
///
/// Returns an error if the level is not a valid filter directive or a global
/// subscriber is already installed.
///
/// # Examples
///
/// ```
/// use cache_storage::config::LoggingConfig;
/// use cache_storage::logging::init_subscriber;
///
/// init_subscriber(&LoggingConfig::default()).expect("Failed to initialize logging");
/// tracing::info!("Application started");
/// ```
pub fn init_subscriber(config: &LoggingConfig) -> Result<(), Box<dyn Error + Send + Sync>> {
    let filter = build_filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
}
