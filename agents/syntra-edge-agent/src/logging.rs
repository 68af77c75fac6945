//! Logging setup for the agent binary.
//!
//! `RUST_LOG` overrides the level from the config file.

use anyhow::{anyhow, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cli::config::LoggingConfig;

/// Output layout of log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow!("unknown log format '{}'", other)),
        }
    }
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber. Fails if one is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let format: LogFormat = config.format.parse()?;
    let filter = env_filter(&config.level);
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(true).pretty())
            .try_init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().with_target(true).compact())
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .try_init(),
    };

    installed.map_err(|e| anyhow!("failed to install log subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_formats() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_unknown_format_is_rejected_before_install() {
        let config = LoggingConfig {
            level: "info".to_string(),
            format: "yaml".to_string(),
        };
        let err = init_logging(&config).unwrap_err();
        assert!(err.to_string().contains("yaml"));
    }
}
