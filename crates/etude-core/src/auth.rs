// src/auth.rs
//! Interfaces to the credential store and cache, and the service object the
//! two credential routes call into.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("connection pool `{0}` could not be initialized: {1}")]
    PoolInit(&'static str, String),

    #[error("credential backend I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed credential record at line {line}")]
    Malformed { line: usize },

    #[error("invalid user name")]
    InvalidName,

    #[error("credential backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Found,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    Inserted,
    Exists,
}

/// Persistent user/password store.
pub trait CredentialStore: Send + Sync {
    /// Whether `name` is registered with exactly `passwd`.
    fn lookup(&self, name: &str, passwd: &str) -> Result<Lookup, CredentialError>;

    /// Register `name`, unless the name is already taken.
    fn register(&self, name: &str, passwd: &str) -> Result<Insert, CredentialError>;
}

/// Read-through shortcut consulted before the store.
pub trait CredentialCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, CredentialError>;
    fn set(&self, key: &str, value: &str) -> Result<(), CredentialError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created,
    AlreadyExists,
    Failed,
}

/// Credential service shared by every worker.
#[derive(Clone)]
pub struct Credentials {
    store: Arc<dyn CredentialStore>,
    cache: Option<Arc<dyn CredentialCache>>,
}

impl Credentials {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store, cache: None }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CredentialCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Check a login. Cache errors fall through to the store; store errors
    /// are returned.
    pub fn login(&self, name: &str, passwd: &str) -> Result<LoginOutcome, CredentialError> {
        if let Some(cache) = &self.cache {
            match cache.get(name) {
                Ok(Some(cached)) if cached == passwd => return Ok(LoginOutcome::Accepted),
                Ok(Some(_)) => return Ok(LoginOutcome::Rejected),
                Ok(None) => {}
                Err(e) => debug!(error = %e, "cache lookup failed, using store"),
            }
        }

        match self.store.lookup(name, passwd)? {
            Lookup::Found => {
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.set(name, passwd) {
                        warn!(error = %e, "failed to populate credential cache");
                    }
                }
                Ok(LoginOutcome::Accepted)
            }
            Lookup::NotFound => Ok(LoginOutcome::Rejected),
        }
    }

    pub fn register(&self, name: &str, passwd: &str) -> RegisterOutcome {
        match self.store.register(name, passwd) {
            Ok(Insert::Inserted) => RegisterOutcome::Created,
            Ok(Insert::Exists) => RegisterOutcome::AlreadyExists,
            Err(e) => {
                warn!(error = %e, "registration failed");
                RegisterOutcome::Failed
            }
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("cached", &self.cache.is_some())
            .finish()
    }
}
