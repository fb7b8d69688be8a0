//! Tracing subscriber setup

use anyhow::{Context, Result};
use nautilus_config::{LogFormat, LoggingConfig};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber described by the logging section
///
/// `RUST_LOG` directives are honored on top of the configured level. Fails if
/// a subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(parse_directive(&config.level)?);

    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_level(true),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()?,
    }

    Ok(())
}

fn parse_directive(level: &str) -> Result<Directive> {
    level
        .trim()
        .to_lowercase()
        .parse()
        .with_context(|| format!("invalid log level '{level}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_directive() {
        assert_eq!(parse_directive("DEBUG").unwrap().to_string(), "debug");
        assert_eq!(
            parse_directive("nautilus_router=trace").unwrap().to_string(),
            "nautilus_router=trace"
        );
    }

    #[test]
    fn test_second_init_fails() {
        let config = LoggingConfig::default();
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
