//! Structured logging initialization.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{AppError, Result};

/// Initialize the global subscriber.
///
/// `RUST_LOG` wins over `logging.level`. JSON output is used when configured or
/// when `RUST_ENV=production`; otherwise human-readable output. Logs go to
/// stderr; stdout belongs to the stdout sink.
pub fn init(cfg: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .map_err(|e| AppError::Config(format!("invalid logging.level `{}`: {e}", cfg.level)))?;

    let is_production = std::env::var("RUST_ENV")
        .map(|v| v == "production")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if cfg.format == LogFormat::Json || is_production {
        registry
            .with(fmt::layer().json().with_current_span(true).with_target(true).with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| AppError::Config(format!("logging already initialized: {e}")))
}
