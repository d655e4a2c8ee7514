//! Logging and tracing initialization.
//!
//! The level comes from `RUST_LOG` and defaults to `info`:
//!
//! ```bash
//! # Per-connection open/close and header traces
//! RUST_LOG=etude_core=debug etude 0.0.0.0 9006
//!
//! # Only capacity warnings and errors
//! RUST_LOG=warn etude 0.0.0.0 9006
//! ```
//!
//! Every initializer returns an error, rather than panicking, if a global
//! subscriber is already installed.

use std::str::FromStr;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{EtudeError, EtudeResult};

/// Output format for [`init`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = EtudeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(EtudeError::Config(format!("unknown log format `{other}`"))),
        }
    }
}

/// Initialize logging in the given format.
pub fn init(format: LogFormat) -> EtudeResult<()> {
    match format {
        LogFormat::Compact => init_logging(),
        LogFormat::Pretty => init_logging_pretty(),
        LogFormat::Json => init_logging_json(),
    }
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

fn already_set(e: impl std::fmt::Display) -> EtudeError {
    EtudeError::Config(format!("logging already initialized: {e}"))
}

/// Initialize logging with sensible defaults: plain formatted lines on stdout.
pub fn init_logging() -> EtudeResult<()> {
    init_logging_with_level("info")
}

/// Initialize logging with a specific default level.
///
/// `RUST_LOG` still wins when it is set.
///
/// # Common Levels
///
/// - `"trace"` - Very verbose, shows everything
/// - `"debug"` - Connection lifecycle and header traces
/// - `"info"` - Startup and shutdown
/// - `"warn"` - Capacity conditions only
pub fn init_logging_with_level(level: &str) -> EtudeResult<()> {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(already_set)
}

/// Initialize pretty-formatted logging (recommended for development).
pub fn init_logging_pretty() -> EtudeResult<()> {
    tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_line_number(true)
                .with_thread_ids(true)
                .with_target(true),
        )
        .try_init()
        .map_err(already_set)
}

/// Initialize JSON-formatted logging, one object per line.
pub fn init_logging_json() -> EtudeResult<()> {
    tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .map_err(already_set)
}
