//! Logging setup.
//!
//! `RUST_LOG` takes precedence over the configured level. Output goes to
//! stderr, compact text or one JSON object per line.

use crate::config::{LogFormat, LoggingConfig};
use crate::core::{Error, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Build the filter for `config`, honouring `RUST_LOG` when set.
pub fn filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
    }
    EnvFilter::try_new(&config.level)
        .map_err(|e| Error::Config(format!("invalid log level '{}': {}", config.level, e)))
}

/// Install the global subscriber.
///
/// Calling this again once a subscriber is installed is a no-op.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = filter(config)?;
    let installed = match config.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr)
                    .with_filter(filter),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(std::io::stderr)
                    .with_filter(filter),
            )
            .try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_rejected() {
        if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
            return;
        }
        let config = LoggingConfig {
            level: "weightsync=notalevel".to_string(),
            format: LogFormat::Text,
        };
        assert!(matches!(filter(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_init_twice() {
        let config = LoggingConfig::default();
        assert!(init(&config).is_ok());
        assert!(init(&LoggingConfig {
            format: LogFormat::Json,
            ..config
        })
        .is_ok());
    }
}
