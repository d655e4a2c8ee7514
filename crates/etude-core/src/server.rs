// src/server.rs
use std::net::SocketAddr;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::auth::Credentials;
use crate::config::ServerConfig;
use crate::error::{EtudeError, EtudeResult};
use crate::reactor::{Notifier, Reactor};
use crate::router::RouteTable;
use crate::site::Site;
use crate::stats::StatsSnapshot;
use crate::syscalls;

/// Builder for a server instance.
///
/// ```rust,no_run
/// use etude_core::{Server, ServerConfig};
///
/// let stats = Server::new(ServerConfig::default())
///     .doc_root("./root")
///     .workers(8)
///     .serve("0.0.0.0", 9006)?;
/// # Ok::<(), etude_core::EtudeError>(())
/// ```
pub struct Server {
    config: ServerConfig,
    routes: RouteTable,
    credentials: Option<Credentials>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            routes: RouteTable::standard(),
            credentials: None,
        }
    }

    /// A server configured from `ETUDE_*` environment variables.
    pub fn from_env() -> EtudeResult<Self> {
        Ok(Self::new(ServerConfig::from_env()?))
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn doc_root(mut self, doc_root: impl Into<PathBuf>) -> Self {
        self.config.doc_root = doc_root.into();
        self
    }

    pub fn routes(mut self, routes: RouteTable) -> Self {
        self.routes = routes;
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn bind(self, host: &str, port: u16) -> EtudeResult<Reactor> {
        let addr = syscalls::resolve_addr(host, port)?;
        let mut site = Site::new(self.config.doc_root.clone()).with_routes(self.routes);
        if let Some(credentials) = self.credentials {
            site = site.with_credentials(credentials);
        }
        Reactor::new(self.config, site, addr)
    }

    /// Bind and run the reactor on the calling thread until shutdown.
    pub fn serve(self, host: &str, port: u16) -> EtudeResult<StatsSnapshot> {
        self.bind(host, port)?.run()
    }

    /// Bind, then run the reactor on a background thread.
    pub fn start(self, host: &str, port: u16) -> EtudeResult<ServerHandle> {
        let reactor = self.bind(host, port)?;
        let local_addr = reactor.local_addr();
        let notifier = reactor.notifier();

        let name = "etude-reactor".to_string();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || reactor.run())
            .map_err(|source| EtudeError::Spawn { name, source })?;

        Ok(ServerHandle {
            local_addr,
            notifier,
            thread: Some(thread),
        })
    }
}

/// A server running on its own thread. Dropping the handle stops it.
pub struct ServerHandle {
    local_addr: SocketAddr,
    notifier: Notifier,
    thread: Option<JoinHandle<EtudeResult<StatsSnapshot>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    /// Stop the reactor and wait for it to finish tearing down.
    pub fn shutdown(mut self) -> EtudeResult<StatsSnapshot> {
        self.stop()
    }

    fn stop(&mut self) -> EtudeResult<StatsSnapshot> {
        let Some(thread) = self.thread.take() else {
            return Err(EtudeError::Config("server already stopped".into()));
        };
        if let Err(e) = self.notifier.shutdown() {
            debug!(error = %e, "shutdown byte not delivered");
        }
        thread
            .join()
            .map_err(|_| EtudeError::Panic("etude-reactor".into()))?
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if let Err(e) = self.stop() {
                error!(error = %e, "server did not stop cleanly");
            }
        }
    }
}
