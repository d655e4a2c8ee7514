use std::path::PathBuf;

use etude_core::{EtudeError, EtudeResult};
use serde::Deserialize;

/// Settings for the credential collaborators.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Credential file (default: ./users.db)
    pub store_path: PathBuf,

    /// Append handles in the store pool (default: 8)
    pub store_pool: usize,

    /// Cache sessions (default: 8)
    pub cache_pool: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("./users.db"),
            store_pool: 8,
            cache_pool: 8,
        }
    }
}

impl AuthConfig {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> EtudeResult<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EtudeResult<Self> {
        let defaults = Self::default();
        let pool = |key: &str, default: usize| -> EtudeResult<usize> {
            match lookup(key) {
                None => Ok(default),
                Some(raw) => match raw.trim().parse() {
                    Ok(0) | Err(_) => Err(EtudeError::Config(format!(
                        "{key}: `{raw}` is not a positive pool size"
                    ))),
                    Ok(n) => Ok(n),
                },
            }
        };
        Ok(Self {
            store_path: lookup("ETUDE_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_path),
            store_pool: pool("ETUDE_STORE_POOL", defaults.store_pool)?,
            cache_pool: pool("ETUDE_CACHE_POOL", defaults.cache_pool)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_overrides() {
        let config = AuthConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.store_path, PathBuf::from("./users.db"));
        assert_eq!(config.store_pool, 8);

        let config = AuthConfig::from_lookup(|key| match key {
            "ETUDE_STORE_PATH" => Some("/var/lib/etude/users".into()),
            "ETUDE_CACHE_POOL" => Some("2".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.store_path, PathBuf::from("/var/lib/etude/users"));
        assert_eq!(config.cache_pool, 2);
    }

    #[test]
    fn zero_pool_is_rejected() {
        let err = AuthConfig::from_lookup(|key| (key == "ETUDE_STORE_POOL").then(|| "0".into()));
        assert!(matches!(err, Err(EtudeError::Config(_))));
    }
}
