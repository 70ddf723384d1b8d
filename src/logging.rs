use crate::config::LoggingConfig;
use crate::error::{NegotiationError, Result};
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| NegotiationError::Config(format!("Invalid log level: {}", e)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match config.format.as_deref() {
        Some("json") => builder.json().try_init(),
        _ => builder.try_init(),
    };

    installed.map_err(|e| NegotiationError::Config(format!("Failed to install logger: {}", e)))
}
