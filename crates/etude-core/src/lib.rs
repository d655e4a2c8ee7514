// src/lib.rs
//! Event-driven HTTP/1.1 static file server.
//!
//! One reactor thread owns the epoll set and every socket; a fixed worker
//! pool parses requests and lays out responses; an idle timer wheel evicts
//! quiet connections. Files go out through `mmap` and `writev`.

pub mod auth;
pub mod buffer;
pub mod config;
pub mod conn;
pub mod error;
pub mod file;
pub mod http;
pub mod logging;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod router;
pub mod server;
pub mod site;
pub mod slab;
pub mod stats;
pub mod sync;
pub mod syscalls;
pub mod timer;

// Re-exports for users
pub use auth::{
    CredentialCache, CredentialError, CredentialStore, Credentials, Insert, LoginOutcome, Lookup,
    RegisterOutcome,
};
pub use config::ServerConfig;
pub use error::{EtudeError, EtudeResult};
pub use logging::LogFormat;
pub use reactor::Notifier;
pub use router::{Route, RouteTable};
pub use server::{Server, ServerHandle};
pub use stats::StatsSnapshot;
