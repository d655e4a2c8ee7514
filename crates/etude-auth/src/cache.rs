//! In-process credential cache behind a bounded set of sessions.

use std::collections::HashMap;

use etude_core::sync::Locker;
use etude_core::{CredentialCache, CredentialError};
use tracing::trace;

use crate::pool::{ConnectionPool, PooledConnection};

struct Session {
    id: usize,
}

/// Read-through shortcut consulted before the credential store.
///
/// Callers never wait for a session: when every session is busy the lookup
/// reports the cache unavailable and the caller goes to the store.
pub struct MemoryCache {
    entries: Locker<HashMap<String, String>>,
    sessions: ConnectionPool<Session>,
}

impl MemoryCache {
    pub fn new(sessions: usize) -> Result<Self, CredentialError> {
        Ok(Self {
            entries: Locker::new(HashMap::new()),
            sessions: ConnectionPool::connect("credential-cache", sessions, |id| Ok(Session { id }))?,
        })
    }

    fn session(&self) -> Result<PooledConnection<'_, Session>, CredentialError> {
        self.sessions
            .try_acquire()
            .ok_or_else(|| CredentialError::Unavailable("all cache sessions busy".into()))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CredentialCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<String>, CredentialError> {
        let session = self.session()?;
        let value = self.entries.lock().get(key).cloned();
        trace!(session = session.id, key, hit = value.is_some(), "cache get");
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CredentialError> {
        let session = self.session()?;
        self.entries.lock().insert(key.to_string(), value.to_string());
        trace!(session = session.id, key, "cache set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_and_set() {
        let cache = MemoryCache::new(2).unwrap();
        assert_eq!(cache.get("ann").unwrap(), None);
        cache.set("ann", "pw").unwrap();
        assert_eq!(cache.get("ann").unwrap().as_deref(), Some("pw"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn busy_sessions_report_unavailable() {
        let cache = MemoryCache::new(1).unwrap();
        let held = cache.sessions.acquire().unwrap();
        assert!(matches!(cache.get("ann"), Err(CredentialError::Unavailable(_))));
        drop(held);
        assert!(cache.get("ann").is_ok());
    }
}
