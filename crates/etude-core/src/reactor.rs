// src/reactor.rs
//! The event loop: accepts, reads, hands complete reads to the worker pool,
//! flushes responses and advances the idle timer.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use libc::c_int;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::conn::{
    Conn, ConnState, Disposition, IdleEntry, IdleTimers, ReadStatus, WriteStatus, split_token,
    token,
};
use crate::error::{EtudeError, EtudeResult};
use crate::http::BUSY_NOTICE;
use crate::pool::{PoolConfig, WorkerPool};
use crate::site::Site;
use crate::slab::ConnectionSlab;
use crate::stats::{ServerStats, StatsSnapshot};
use crate::sync::{Cond, Locker};
use crate::syscalls::{
    self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, Epoll, conn_interest, empty_event,
};
use crate::timer::{DEFAULT_SLOTS, TimerWheel};

pub const MAX_EVENT_NUMBER: usize = 10_000;
pub const MAX_FD: usize = 65_536;

const LISTENER: u64 = u64::MAX;
const SIGNALS: u64 = u64::MAX - 1;

const TICK_BYTE: u8 = libc::SIGALRM as u8;
const STOP_BYTE: u8 = libc::SIGTERM as u8;

/// State shared by the reactor thread and every worker.
pub struct Engine {
    pub epoll: Epoll,
    pub timers: IdleTimers,
    pub stats: ServerStats,
    pub site: Site,
}

impl Engine {
    pub fn new(site: Site, slots: usize) -> EtudeResult<Self> {
        Ok(Self {
            epoll: Epoll::new()?,
            timers: TimerWheel::new(slots),
            stats: ServerStats::new(),
            site,
        })
    }

    /// Worker side of a connection: parse, lay out the response, hand the
    /// socket back to the reactor with the next interest set.
    pub fn handle_task(&self, conn: Arc<Conn>) {
        if !conn.transition(ConnState::Queued, ConnState::Processing) {
            // Evicted while waiting in the queue.
            conn.close(self);
            return;
        }

        let _unwind = CloseOnUnwind {
            engine: self,
            conn: &conn,
        };
        let handed_back = match conn.process(&self.site) {
            Disposition::ReadMore => {
                conn.rearm(&self.epoll, ConnState::Processing, ConnState::Idle, EPOLLIN)
            }
            Disposition::Write => {
                self.stats.inc_req();
                conn.rearm(&self.epoll, ConnState::Processing, ConnState::Sending, EPOLLOUT)
            }
            Disposition::Close => false,
        };
        if !handed_back {
            conn.close(self);
        }
    }

    /// Idle-timer expiry. Tears the connection down if the reactor owns it;
    /// otherwise the worker holding it does so on its next transition.
    pub fn evict(&self, entry: IdleEntry) {
        let IdleEntry { conn, generation } = entry;
        if conn.generation() != generation || conn.is_closed() {
            return;
        }

        self.stats.inc_eviction();
        match conn.mark_evicted() {
            ConnState::Idle | ConnState::Sending => {
                debug!(fd = conn.fd(), "idle timeout");
                conn.close(self);
            }
            ConnState::Queued | ConnState::Processing => {
                debug!(fd = conn.fd(), "idle timeout while in a worker");
            }
            ConnState::Free => {}
        }
    }
}

/// Closes a worker-held connection if its handler unwinds.
struct CloseOnUnwind<'a> {
    engine: &'a Engine,
    conn: &'a Conn,
}

impl Drop for CloseOnUnwind<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            error!(fd = self.conn.fd(), "handler panicked, closing connection");
            self.conn.close(self.engine);
        }
    }
}

/// Handle on the self-pipe. Writes the same bytes the signal handler does.
#[derive(Debug, Clone)]
pub struct Notifier {
    fd: Arc<OwnedFd>,
}

impl Notifier {
    /// Request one idle-timer tick.
    pub fn tick(&self) -> io::Result<()> {
        self.send(TICK_BYTE)
    }

    /// Ask the reactor to stop after the current batch of events.
    pub fn shutdown(&self) -> io::Result<()> {
        self.send(STOP_BYTE)
    }

    fn send(&self, byte: u8) -> io::Result<()> {
        // A full pipe already holds undelivered bytes; dropping one is fine.
        syscalls::send_nonblocking(self.fd.as_raw_fd(), &[byte]).map(|_| ())
    }
}

/// Helper thread standing in for SIGALRM when signal handling is off.
struct Ticker {
    stop: Arc<(Locker<bool>, Cond)>,
    handle: JoinHandle<()>,
}

impl Ticker {
    fn spawn(notifier: Notifier, period: Duration) -> EtudeResult<Self> {
        let stop = Arc::new((Locker::new(false), Cond::new()));
        let flag = stop.clone();
        let name = "etude-ticker".to_string();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let (stopped, cond) = &*flag;
                let mut guard = stopped.lock();
                while !*guard {
                    let (next, timed_out) = cond.wait_timeout(guard, period);
                    guard = next;
                    if timed_out && !*guard {
                        if let Err(e) = notifier.tick() {
                            debug!(error = %e, "tick not delivered");
                        }
                    }
                }
            })
            .map_err(|source| EtudeError::Spawn { name, source })?;
        Ok(Self { stop, handle })
    }

    fn stop(self) {
        let (stopped, cond) = &*self.stop;
        *stopped.lock() = true;
        cond.signal();
        if self.handle.join().is_err() {
            error!("ticker thread panicked");
        }
    }
}

pub struct Reactor {
    config: ServerConfig,
    engine: Arc<Engine>,
    pool: WorkerPool<Arc<Conn>>,
    slab: ConnectionSlab,
    listener: OwnedFd,
    local_addr: SocketAddr,
    signal_rx: OwnedFd,
    notifier: Notifier,
    ticker: Option<Ticker>,
    stop: bool,
    timer_due: bool,
    torn_down: bool,
}

impl Reactor {
    /// Bind `addr`, set up the readiness set and start the worker pool.
    pub fn new(config: ServerConfig, site: Site, addr: SocketAddr) -> EtudeResult<Self> {
        config.validate()?;
        let engine = Arc::new(Engine::new(site, DEFAULT_SLOTS)?);

        let listen_fd = syscalls::create_listen_socket(addr, config.backlog)?;
        // SAFETY: freshly created and owned by nobody else.
        let listener = unsafe { OwnedFd::from_raw_fd(listen_fd) };
        let local_addr = syscalls::local_addr(listen_fd)?;
        engine.epoll.add(listen_fd, LISTENER, EPOLLIN)?;

        let (signal_rx, signal_tx) = syscalls::create_socketpair()?;
        engine.epoll.add(signal_rx.as_raw_fd(), SIGNALS, EPOLLIN)?;

        let mut pool_config = PoolConfig::new(config.workers, config.max_requests);
        pool_config.pin_cores = config.pin_workers;
        let worker_engine = engine.clone();
        let pool = WorkerPool::spawn(pool_config, move |conn: Arc<Conn>| {
            worker_engine.handle_task(conn)
        })?;

        Ok(Self {
            config,
            engine,
            pool,
            slab: ConnectionSlab::new(MAX_FD),
            listener,
            local_addr,
            signal_rx,
            notifier: Notifier {
                fd: Arc::new(signal_tx),
            },
            ticker: None,
            stop: false,
            timer_due: false,
            torn_down: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    /// Run until a stop byte arrives. Returns the final counters.
    pub fn run(mut self) -> EtudeResult<StatsSnapshot> {
        self.start_ticks()?;
        info!(
            addr = %self.local_addr,
            workers = self.pool.threads(),
            root = %self.engine.site.doc_root().display(),
            "etude listening"
        );

        let mut events = vec![empty_event(); MAX_EVENT_NUMBER];
        let result = loop {
            if self.stop {
                break Ok(());
            }
            let n = match self.engine.epoll.wait(&mut events, -1) {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "epoll wait failed");
                    break Err(EtudeError::from(e));
                }
            };

            for event in &events[..n] {
                let (tok, flags) = (event.u64, event.events);
                match tok {
                    LISTENER => self.accept_all(),
                    SIGNALS => self.drain_signals(),
                    _ => self.conn_event(tok, flags),
                }
            }

            // I/O first, timeouts after.
            if self.timer_due {
                self.timer_due = false;
                self.tick();
            }
        };

        self.teardown();
        result.map(|()| self.engine.stats.snapshot())
    }

    fn start_ticks(&mut self) -> EtudeResult<()> {
        if self.config.signals {
            syscalls::install_signal_forwarding(self.notifier.fd.as_raw_fd())?;
            syscalls::schedule_alarm(self.config.alarm_secs());
        } else {
            self.ticker = Some(Ticker::spawn(self.notifier.clone(), self.config.tick())?);
        }
        Ok(())
    }

    fn tick(&mut self) {
        let engine = &self.engine;
        let expired = engine.timers.tick(|entry| engine.evict(entry));
        if expired > 0 {
            debug!(expired, "idle timers expired");
        }
        if self.config.signals {
            syscalls::schedule_alarm(self.config.alarm_secs());
        }
    }

    fn drain_signals(&mut self) {
        let mut buf = [0u8; 1024];
        loop {
            match syscalls::recv_nonblocking(self.signal_rx.as_raw_fd(), &mut buf) {
                Ok(Some(0)) | Ok(None) => break,
                Ok(Some(n)) => {
                    for &byte in &buf[..n] {
                        match byte {
                            TICK_BYTE => self.timer_due = true,
                            STOP_BYTE => {
                                info!("shutdown requested");
                                self.stop = true;
                            }
                            other => debug!(signal = other, "ignored signal byte"),
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "signal pipe read failed");
                    break;
                }
            }
        }
    }

    fn accept_all(&mut self) {
        loop {
            match syscalls::accept_connection(self.listener.as_raw_fd()) {
                Ok(Some((fd, peer))) => self.admit(fd, peer),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn admit(&mut self, fd: c_int, peer: Option<SocketAddr>) {
        if self.engine.stats.active() >= self.config.max_connections {
            warn!(fd, "connection ceiling reached");
            refuse(fd);
            return;
        }
        let Some(conn) = self.slab.claim(fd) else {
            warn!(fd, "descriptor outside the connection table");
            refuse(fd);
            return;
        };

        self.engine.stats.inc_conn();
        let generation = conn.open(fd, peer);
        let id = self.engine.timers.add(
            self.config.idle_timeout,
            IdleEntry {
                conn: conn.clone(),
                generation,
            },
        );
        conn.set_timer(id);

        if let Err(e) = self
            .engine
            .epoll
            .add(fd, token(fd, generation), conn_interest(EPOLLIN))
        {
            warn!(fd, error = %e, "epoll registration failed");
            conn.close(&self.engine);
            return;
        }
        debug!(fd, peer = ?peer, "connection accepted");
    }

    fn conn_event(&mut self, tok: u64, flags: u32) {
        let (fd, generation) = split_token(tok);
        let Some(conn) = self.slab.get(fd).cloned() else {
            return;
        };
        if conn.generation() != generation || conn.is_closed() {
            return;
        }

        if flags & (EPOLLERR | EPOLLHUP | EPOLLRDHUP) != 0 {
            if matches!(conn.state(), ConnState::Idle | ConnState::Sending) {
                debug!(fd, flags, "peer hung up");
                conn.close(&self.engine);
            }
        } else if flags & EPOLLIN != 0 {
            self.on_readable(conn);
        } else if flags & EPOLLOUT != 0 {
            self.on_writable(conn);
        }
    }

    fn on_readable(&mut self, conn: Arc<Conn>) {
        if conn.state() != ConnState::Idle {
            return;
        }
        match conn.read(&self.engine.timers) {
            ReadStatus::Received(_) => {
                if !conn.transition(ConnState::Idle, ConnState::Queued) {
                    conn.close(&self.engine);
                    return;
                }
                if let Err(conn) = self.pool.append(conn) {
                    warn!(fd = conn.fd(), "task queue full, dropping connection");
                    self.engine.stats.inc_rejected();
                    conn.close(&self.engine);
                }
            }
            ReadStatus::PeerClosed => {
                conn.close(&self.engine);
            }
            ReadStatus::Overflow => {
                debug!(fd = conn.fd(), "read buffer overflow");
                conn.close(&self.engine);
            }
            ReadStatus::Failed(e) => {
                debug!(fd = conn.fd(), error = %e, "read failed");
                conn.close(&self.engine);
            }
        }
    }

    fn on_writable(&mut self, conn: Arc<Conn>) {
        if conn.state() != ConnState::Sending {
            return;
        }
        let epoll = &self.engine.epoll;
        let keep = match conn.write(&self.engine.stats) {
            WriteStatus::Partial => {
                conn.rearm(epoll, ConnState::Sending, ConnState::Sending, EPOLLOUT)
            }
            WriteStatus::KeepAlive => conn.rearm(epoll, ConnState::Sending, ConnState::Idle, EPOLLIN),
            WriteStatus::Close | WriteStatus::Failed => false,
        };
        if !keep {
            conn.close(&self.engine);
        }
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        self.pool.shutdown();
        for conn in self.slab.iter() {
            if !conn.is_closed() {
                conn.close(&self.engine);
            }
        }
        if let Some(ticker) = self.ticker.take() {
            ticker.stop();
        }
        if self.config.signals {
            syscalls::clear_signal_forwarding(self.notifier.fd.as_raw_fd());
            syscalls::schedule_alarm(0);
        }

        let stats = self.engine.stats.snapshot();
        info!(
            requests = stats.requests,
            bytes_sent = stats.bytes_sent,
            evictions = stats.evictions,
            rejected = stats.rejected,
            "etude stopped"
        );
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Tell a client we are full and hang up.
fn refuse(fd: c_int) {
    if let Err(e) = syscalls::send_nonblocking(fd, BUSY_NOTICE) {
        debug!(fd, error = %e, "busy notice not sent");
    }
    syscalls::close_fd(fd);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialError, CredentialStore, Credentials, Insert, Lookup};
    use std::io::{Read, Write};
    use std::os::fd::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::panic::{self, AssertUnwindSafe};

    struct BrokenStore;

    impl CredentialStore for BrokenStore {
        fn lookup(&self, _: &str, _: &str) -> Result<Lookup, CredentialError> {
            panic!("store lookup failed");
        }

        fn register(&self, _: &str, _: &str) -> Result<Insert, CredentialError> {
            panic!("store register failed");
        }
    }

    fn idle_conn(engine: &Engine) -> (Arc<Conn>, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let conn = Arc::new(Conn::new());
        conn.open(ours.into_raw_fd(), None);
        engine.stats.inc_conn();
        (conn, theirs)
    }

    #[test]
    fn evicts_idle_connections_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(Site::new(dir.path()), 4).unwrap();
        let (conn, _peer) = idle_conn(&engine);

        engine.evict(IdleEntry {
            conn: conn.clone(),
            generation: conn.generation(),
        });
        assert!(conn.is_closed());
        assert_eq!(engine.stats.active(), 0);
        assert_eq!(engine.stats.snapshot().evictions, 1);
    }

    #[test]
    fn stale_generation_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(Site::new(dir.path()), 4).unwrap();
        let (conn, _peer) = idle_conn(&engine);

        engine.evict(IdleEntry {
            conn: conn.clone(),
            generation: conn.generation().wrapping_sub(1),
        });
        assert!(!conn.is_closed());
        assert!(!conn.is_evicted());
        conn.close(&engine);
    }

    #[test]
    fn handler_panic_releases_the_connection() {
        let dir = tempfile::tempdir().unwrap();
        let site = Site::new(dir.path()).with_credentials(Credentials::new(Arc::new(BrokenStore)));
        let engine = Engine::new(site, 4).unwrap();

        let (ours, mut peer) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let conn = Arc::new(Conn::new());
        conn.open(ours.into_raw_fd(), None);
        engine.stats.inc_conn();

        peer.write_all(b"POST /2CGISQL.cgi HTTP/1.1\r\nContent-Length: 20\r\n\r\nuser=ann&password=pw")
            .unwrap();
        assert!(matches!(conn.read(&engine.timers), ReadStatus::Received(_)));
        assert!(conn.transition(ConnState::Idle, ConnState::Queued));

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| engine.handle_task(conn.clone())));
        assert!(outcome.is_err());
        assert!(conn.is_closed());
        assert_eq!(engine.stats.active(), 0);

        // The peer sees a hang-up, not a response.
        let mut buf = [0u8; 16];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn notifier_writes_signal_bytes() {
        let (rx, tx) = syscalls::create_socketpair().unwrap();
        let notifier = Notifier { fd: Arc::new(tx) };
        notifier.tick().unwrap();
        notifier.clone().shutdown().unwrap();

        let mut buf = [0u8; 8];
        let n = syscalls::recv_nonblocking(rx.as_raw_fd(), &mut buf)
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], &[TICK_BYTE, STOP_BYTE]);
    }

    #[test]
    fn reactor_stops_on_notifier() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            workers: 1,
            signals: false,
            tick_ms: 10,
            ..ServerConfig::default()
        };
        let addr = syscalls::resolve_addr("127.0.0.1", 0).unwrap();
        let reactor = Reactor::new(config, Site::new(dir.path()), addr).unwrap();
        assert_ne!(reactor.local_addr().port(), 0);

        let notifier = reactor.notifier();
        let handle = thread::spawn(move || reactor.run());
        notifier.shutdown().unwrap();
        let stats = handle.join().unwrap().unwrap();
        assert_eq!(stats.active, 0);
    }
}
