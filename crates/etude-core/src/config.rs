use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{EtudeError, EtudeResult};

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory files are served from (default: ./root)
    pub doc_root: PathBuf,

    /// Worker threads (default: one per CPU)
    pub workers: usize,

    /// Task queue capacity (default: 10000)
    pub max_requests: usize,

    /// Active-connection ceiling; clients beyond it get a busy notice.
    pub max_connections: usize,

    /// Idle timeout, in ticks (default: 15)
    pub idle_timeout: u64,

    /// Tick period in milliseconds (default: 1000). The SIGALRM tick source
    /// rounds up to whole seconds.
    pub tick_ms: u64,

    /// Listen backlog (default: 1024)
    pub backlog: i32,

    /// Pin worker threads to cores.
    pub pin_workers: bool,

    /// Install SIGALRM/SIGTERM/SIGPIPE handling. Embedded servers (tests)
    /// turn this off and tick from a helper thread instead.
    pub signals: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            doc_root: PathBuf::from("./root"),
            workers: num_cpus::get(),
            max_requests: 10_000,
            max_connections: 65_535,
            idle_timeout: 15,
            tick_ms: 1000,
            backlog: 1024,
            pin_workers: false,
            signals: true,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> EtudeResult<Self> {
        // A missing .env file is fine.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EtudeResult<Self> {
        let defaults = Self::default();
        let config = Self {
            doc_root: lookup("ETUDE_DOC_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.doc_root),
            workers: env_parse(&lookup, "ETUDE_WORKERS", defaults.workers)?,
            max_requests: env_parse(&lookup, "ETUDE_MAX_REQUESTS", defaults.max_requests)?,
            max_connections: env_parse(&lookup, "ETUDE_MAX_CONNECTIONS", defaults.max_connections)?,
            idle_timeout: env_parse(&lookup, "ETUDE_IDLE_TIMEOUT", defaults.idle_timeout)?,
            tick_ms: env_parse(&lookup, "ETUDE_TICK_MS", defaults.tick_ms)?,
            backlog: env_parse(&lookup, "ETUDE_BACKLOG", defaults.backlog)?,
            pin_workers: env_flag(&lookup, "ETUDE_PIN_WORKERS", defaults.pin_workers)?,
            signals: env_flag(&lookup, "ETUDE_SIGNALS", defaults.signals)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EtudeResult<()> {
        if self.workers == 0 {
            return Err(EtudeError::Config("workers must be at least 1".into()));
        }
        if self.max_requests == 0 {
            return Err(EtudeError::Config("max_requests must be at least 1".into()));
        }
        if self.idle_timeout == 0 {
            return Err(EtudeError::Config("idle_timeout must be at least 1 tick".into()));
        }
        if self.tick_ms == 0 {
            return Err(EtudeError::Config("tick_ms must be at least 1".into()));
        }
        if self.backlog <= 0 {
            return Err(EtudeError::Config("backlog must be positive".into()));
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// The tick period as an `alarm()` argument.
    pub fn alarm_secs(&self) -> u32 {
        u32::try_from(self.tick_ms.div_ceil(1000))
            .unwrap_or(u32::MAX)
            .max(1)
    }
}

fn env_parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> EtudeResult<T> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| EtudeError::Config(format!("{key}: `{raw}` is not a valid number"))),
    }
}

fn env_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> EtudeResult<bool> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(EtudeError::Config(format!("{key}: `{raw}` is not a boolean"))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> EtudeResult<ServerConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.doc_root, PathBuf::from("./root"));
        assert_eq!(config.max_requests, 10_000);
        assert_eq!(config.idle_timeout, 15);
        assert!(config.workers >= 1);
        assert!(config.signals);
        assert_eq!(config.alarm_secs(), 1);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("ETUDE_DOC_ROOT", "/srv/www"),
            ("ETUDE_WORKERS", "3"),
            ("ETUDE_TICK_MS", "2500"),
            ("ETUDE_SIGNALS", "no"),
        ])
        .unwrap();
        assert_eq!(config.doc_root, PathBuf::from("/srv/www"));
        assert_eq!(config.workers, 3);
        assert_eq!(config.tick(), Duration::from_millis(2500));
        assert_eq!(config.alarm_secs(), 3);
        assert!(!config.signals);
    }

    #[test]
    fn bad_values_are_errors() {
        assert!(matches!(load(&[("ETUDE_WORKERS", "many")]), Err(EtudeError::Config(_))));
        assert!(matches!(load(&[("ETUDE_WORKERS", "0")]), Err(EtudeError::Config(_))));
        assert!(matches!(load(&[("ETUDE_PIN_WORKERS", "maybe")]), Err(EtudeError::Config(_))));
    }
}
