//! Tracing subscriber setup.

use anyhow::Result;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogConfig;

const DEFAULT_FILTER: &str = "info,tower_http=info";

/// Install the global subscriber: `EnvFilter` plus plain or JSON lines on stdout.
pub(crate) fn init(config: &LogConfig) -> Result<()> {
    let filter = match config.filter.as_deref() {
        Some(directives) => EnvFilter::try_new(directives)?,
        None => EnvFilter::new(DEFAULT_FILTER),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(config.json.then(|| fmt::layer().json()))
        .with((!config.json).then(fmt::layer))
        .try_init()?;

    Ok(())
}
