//! The credential collaborators: a file-backed store, an in-process cache and
//! the bounded connection pool both sit behind.

pub mod cache;
pub mod config;
pub mod pool;
pub mod store;

use std::sync::Arc;

use etude_core::{Credentials, EtudeResult};

pub use cache::MemoryCache;
pub use config::AuthConfig;
pub use pool::{ConnectionPool, PooledConnection};
pub use store::FileStore;

/// Open the store and cache described by `config` and wire them into one
/// credential service.
pub fn open(config: &AuthConfig) -> EtudeResult<Credentials> {
    let store = FileStore::open(&config.store_path, config.store_pool)?;
    let cache = MemoryCache::new(config.cache_pool)?;
    Ok(Credentials::new(Arc::new(store)).with_cache(Arc::new(cache)))
}
