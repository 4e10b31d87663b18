//! Logging setup
//!
//! The crate itself only emits `tracing` events. Applications that have no
//! subscriber of their own can install one from [`LogConfig`].

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogConfig;
use crate::error::{Error, Result};

/// Map a config level string to a `tracing` level, defaulting to INFO
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install a global subscriber: `RUST_LOG` directives plus the configured
/// level, text or JSON output.
///
/// Fails if a global subscriber is already set.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive(parse_level(&config.level).into())
        .add_directive(directive("hyper=warn")?)
        .add_directive(directive("reqwest=warn")?);

    let installed = if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init()
    };

    installed.map_err(|e| Error::Config(format!("failed to install log subscriber: {}", e)))
}

fn directive(s: &str) -> Result<tracing_subscriber::filter::Directive> {
    s.parse()
        .map_err(|e| Error::Config(format!("bad log directive {}: {}", s, e)))
}
